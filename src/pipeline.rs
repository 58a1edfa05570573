use crate::config::Config;
use crate::convert::{BlenderConverter, ConvertRequest};
use crate::error::{AppError, ErrorKind, ImportWarning};
use crate::import::host::{AssetHost, RemoteAssetHost};
use crate::import::reconciler::Reconciler;
use crate::import::request::{ImportOptions, ImportOutcome, ImportRequest};
use crate::protocol::message::OutputLine;
use crate::remote::channel::{connect, CommandListener};
use crate::remote::discovery::Discovery;
use crate::remote::executor::CommandExecutor;
use crate::utils::command_journal::CommandJournal;
use crate::utils::path_utils::resolve_local_file;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub input: PathBuf,
    pub destination_folder: String,
    pub decimate_ratio: f32,
    pub merge_children: bool,
    pub options: ImportOptions,
    /// Keeps the converted file here instead of a scratch directory.
    pub fbx_dir: Option<PathBuf>,
    /// Treat the input as an already converted FBX.
    pub skip_convert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success { message: String, import: ImportOutcome },
    Warning { message: String, import: ImportOutcome },
    Error { kind: ErrorKind, message: String },
}

impl PipelineOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, PipelineOutcome::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Status { message: String },
    Progress { percent: u8 },
    Finished { outcome: PipelineOutcome },
}

/// Sends events, ignoring a receiver that went away.
#[derive(Clone)]
struct Reporter {
    events: mpsc::Sender<PipelineEvent>,
}

impl Reporter {
    async fn status(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(%message, "Pipeline status");
        let _ = self.events.send(PipelineEvent::Status { message }).await;
    }

    async fn progress(&self, percent: u8) {
        let _ = self.events.send(PipelineEvent::Progress { percent }).await;
    }

    async fn remote_output(&self, lines: &[OutputLine]) {
        for line in lines {
            self.status(format!("  [UE] {}", line.text.trim())).await;
        }
    }
}

/// Converts, connects, imports. Always finishes with exactly one `Finished` event.
#[instrument(skip_all, fields(input = %request.input.display(), dest = %request.destination_folder))]
pub async fn run_pipeline(
    config: &Config,
    request: PipelineRequest,
    events: mpsc::Sender<PipelineEvent>,
) -> PipelineOutcome {
    let reporter = Reporter { events };
    let outcome = match execute(config, &request, &reporter).await {
        Ok(import) => summarize(import),
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "Pipeline failed");
            reporter.remote_output(e.partial_output()).await;
            PipelineOutcome::Error { kind: e.kind(), message: e.to_string() }
        }
    };
    let _ = reporter.events.send(PipelineEvent::Finished { outcome: outcome.clone() }).await;
    outcome
}

fn summarize(import: ImportOutcome) -> PipelineOutcome {
    let verb = if import.created { "Imported" } else { "Reimported" };
    let message = format!("{} {}", verb, import.asset_path);
    if import.warnings.is_empty() {
        PipelineOutcome::Success { message, import }
    } else {
        let message = format!("{} with {} warning(s)", message, import.warnings.len());
        PipelineOutcome::Warning { message, import }
    }
}

async fn execute(config: &Config, request: &PipelineRequest, reporter: &Reporter) -> Result<ImportOutcome, AppError> {
    let input = resolve_local_file(&request.input.to_string_lossy())?;

    // Scratch output is removed when this guard drops at the end of the run.
    let mut scratch: Option<TempDir> = None;
    let fbx = if request.skip_convert {
        if !has_extension(&input, "fbx") {
            return Err(AppError::InvalidInput(format!(
                "--skip-convert expects an .fbx file: {}",
                input.display()
            )));
        }
        input
    } else {
        convert_stage(config, request, &input, &mut scratch, reporter).await?
    };

    let import_request =
        ImportRequest::new(&fbx, &request.destination_folder, request.options.clone(), config.staging_strategy)?;
    let outcome = remote_stage(config, &import_request, reporter).await?;

    if let Some(dir) = &request.fbx_dir {
        reporter.status(format!("FBX saved to: {}", dir.display())).await;
    }
    drop(scratch);
    reporter.progress(100).await;
    Ok(outcome)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension().map(|ext| ext.eq_ignore_ascii_case(wanted)).unwrap_or(false)
}

async fn convert_stage(
    config: &Config,
    request: &PipelineRequest,
    input: &Path,
    scratch: &mut Option<TempDir>,
    reporter: &Reporter,
) -> Result<PathBuf, AppError> {
    reporter.status("Checking for Blender...").await;
    reporter.progress(5).await;
    let converter = BlenderConverter::locate(config)?;
    reporter.status(format!("Found Blender: {}", converter.executable().display())).await;

    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "asset".to_string());
    let output_dir = match &request.fbx_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = tempfile::Builder::new().prefix("ue_remote_import_").tempdir()?;
            let path = dir.path().to_path_buf();
            *scratch = Some(dir);
            path
        }
    };
    let convert_request = ConvertRequest::new(
        input.to_path_buf(),
        output_dir.join(format!("{}.fbx", stem)),
        request.decimate_ratio,
        request.merge_children,
    )?;

    reporter.status("Processing in Blender (this may take a while)...").await;
    reporter.progress(15).await;
    let conversion = converter.convert(&convert_request).await?;
    reporter
        .status(format!("Blender processing complete in {:.1}s", conversion.elapsed.as_secs_f64()))
        .await;
    reporter.progress(60).await;
    for line in &conversion.log_tail {
        reporter.status(format!("  [Blender] {}", line)).await;
    }
    reporter
        .status(format!("FBX file created: {:.1} MB", conversion.output_bytes as f64 / (1024.0 * 1024.0)))
        .await;
    Ok(conversion.output)
}

async fn remote_stage(
    config: &Config,
    request: &ImportRequest,
    reporter: &Reporter,
) -> Result<ImportOutcome, AppError> {
    reporter.status("Looking for a running editor...").await;
    reporter.progress(70).await;
    let discovery = Discovery::start(config.discovery.clone(), Uuid::new_v4().to_string()).await;
    let result = async {
        let endpoint = discovery.wait_for_endpoint().await?;
        reporter.status(format!("Connecting to {}", endpoint.display_name)).await;
        let listener = CommandListener::bind(config.channel.command_endpoint).await?;
        let session = connect(&listener, &discovery, &endpoint, &config.channel).await?;
        info!(session_id = %session.id(), "Session open");

        let journal = CommandJournal::new(config.journal_file.clone(), config.journal_max_size_bytes);
        let host = RemoteAssetHost::new(CommandExecutor::new(&session).with_journal(&journal));
        reporter.status(format!("Importing into {}", request.destination_folder)).await;
        let outcome = import_stage(&host, request, reporter).await;
        reporter.remote_output(&host.take_transcript()).await;
        drop(host);
        session.close().await;
        outcome
    }
    .await;
    discovery.stop().await;
    result
}

/// Reconciles against any host and reports its warnings as status lines.
async fn import_stage(
    host: &dyn AssetHost,
    request: &ImportRequest,
    reporter: &Reporter,
) -> Result<ImportOutcome, AppError> {
    let outcome = Reconciler::new(host).reconcile(request).await?;
    reporter.progress(95).await;
    for ImportWarning { kind, message } in &outcome.warnings {
        reporter.status(format!("Warning ({:?}): {}", kind, message)).await;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingStrategy;
    use crate::import::reconciler::fake::FakeHost;
    use std::collections::HashMap;

    fn config(dir: &Path, extra: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = extra.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        vars.insert("JOURNAL_FILE".into(), dir.join("journal.log").to_string_lossy().into_owned());
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    fn request(input: PathBuf, skip_convert: bool) -> PipelineRequest {
        PipelineRequest {
            input,
            destination_folder: "/Game/Imports".into(),
            decimate_ratio: 1.0,
            merge_children: true,
            options: ImportOptions::default(),
            fbx_dir: None,
            skip_convert,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn missing_input_finishes_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(64);
        let outcome = run_pipeline(&config(dir.path(), &[]), request(dir.path().join("gone.glb"), false), tx).await;
        assert!(matches!(outcome, PipelineOutcome::Error { kind: ErrorKind::InvalidInput, .. }));
        let events = drain(rx).await;
        assert_eq!(events.last(), Some(&PipelineEvent::Finished { outcome }));
    }

    #[tokio::test]
    async fn skip_convert_requires_fbx() {
        let dir = tempfile::tempdir().unwrap();
        let glb = dir.path().join("rock.glb");
        std::fs::write(&glb, b"glb").unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let outcome = run_pipeline(&config(dir.path(), &[]), request(glb, true), tx).await;
        match outcome {
            PipelineOutcome::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::InvalidInput);
                assert!(message.contains(".fbx"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_editor_reports_discovery_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let fbx = dir.path().join("Rock.fbx");
        std::fs::write(&fbx, b"fbx").unwrap();
        let cfg = config(dir.path(), &[("MULTICAST_BIND_ADDRESS", "203.0.113.77"), ("DISCOVERY_TIMEOUT_MS", "200")]);
        let (tx, rx) = mpsc::channel(64);
        let outcome = run_pipeline(&cfg, request(fbx, true), tx).await;
        assert!(matches!(outcome, PipelineOutcome::Error { kind: ErrorKind::DiscoveryTimeout, .. }));
        let events = drain(rx).await;
        assert!(events.contains(&PipelineEvent::Progress { percent: 70 }));
        assert_eq!(events.iter().filter(|e| matches!(e, PipelineEvent::Finished { .. })).count(), 1);
    }

    #[tokio::test]
    async fn import_stage_surfaces_warnings() {
        let host = FakeHost::producing(&[("{}", "StaticMesh")]).failing("set_complex_as_simple");
        let options = ImportOptions { complex_as_simple: true, ..ImportOptions::default() };
        let import =
            ImportRequest::new(Path::new("/tmp/Rock.fbx"), "/Game/Imports", options, StagingStrategy::Direct).unwrap();
        let (tx, rx) = mpsc::channel(64);
        let reporter = Reporter { events: tx };
        let outcome = import_stage(&host, &import, &reporter).await.unwrap();
        drop(reporter);

        let summary = summarize(outcome);
        assert!(matches!(&summary, PipelineOutcome::Warning { message, .. } if message.starts_with("Imported /Game/Imports/Rock")));
        let events = drain(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Status { message } if message.starts_with("Warning (Reconciliation)"))));
    }

    #[test]
    fn clean_import_is_success() {
        let import = ImportOutcome {
            asset_path: "/Game/Imports/Rock".into(),
            asset_paths: vec!["/Game/Imports/Rock".into()],
            created: false,
            strategy: crate::import::request::ImportStrategy::ReimportInPlace,
            collision: crate::import::request::CollisionMode::Unchanged,
            materials_relocated: false,
            warnings: Vec::new(),
        };
        assert_eq!(
            summarize(import.clone()),
            PipelineOutcome::Success { message: "Reimported /Game/Imports/Rock".into(), import }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn conversion_status_reports_duration() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let blender = dir.path().join("blender");
        std::fs::write(
            &blender,
            "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"--output\" ]; then out=\"$2\"; fi\n  shift\ndone\nprintf 'fbx' > \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&blender, std::fs::Permissions::from_mode(0o755)).unwrap();
        let glb = dir.path().join("rock.glb");
        std::fs::write(&glb, b"glb").unwrap();

        let cfg = config(dir.path(), &[("BLENDER_PATH", blender.to_str().unwrap())]);
        let mut pipeline_request = request(glb.clone(), false);
        pipeline_request.fbx_dir = Some(dir.path().to_path_buf());
        let (tx, rx) = mpsc::channel(64);
        let reporter = Reporter { events: tx };
        let mut scratch = None;
        let fbx = convert_stage(&cfg, &pipeline_request, &glb, &mut scratch, &reporter).await.unwrap();
        drop(reporter);

        assert_eq!(fbx, dir.path().join("rock.fbx"));
        assert!(scratch.is_none());
        let events = drain(rx).await;
        assert!(events.iter().any(
            |e| matches!(e, PipelineEvent::Status { message } if message.starts_with("Blender processing complete in ") && message.ends_with('s'))
        ));
    }
}
