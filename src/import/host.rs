use crate::error::AppError;
use crate::import::request::{ImportReport, ImportTask, ImportedObject};
use crate::protocol::message::{CommandPayload, CompletionMode, OutputLine};
use crate::remote::executor::{CommandExecutor, CommandSink, OutputMarker, RemoteScript, SuccessEvidence};
use crate::utils::path_utils::{join_content, package_path};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Mutex as StdMutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// Prefix of the single output line carrying a dispatcher call's JSON result.
pub const RESULT_PREFIX: &str = "__BRIDGE_RESULT__";
pub const IMPORT_SUCCESS_MARKER: &str = r"^Successfully imported";
/// The success line is followed by a JSON list of the imported object paths.
const IMPORTED_PREFIX: &str = "Successfully imported:";

const DISPATCHER: &str = include_str!("dispatcher.py");
const DISPATCH_CALL: RemoteScript = RemoteScript {
    name: "bridge-dispatch",
    body: "_ue_bridge_dispatch(__BRIDGE_PARAMS__)",
};

/// The editor-side asset operations the reconciler relies on.
#[async_trait]
pub trait AssetHost: Send + Sync {
    async fn asset_exists(&self, path: &str) -> Result<bool, AppError>;
    async fn directory_exists(&self, path: &str) -> Result<bool, AppError>;
    async fn make_directory(&self, path: &str) -> Result<(), AppError>;
    /// `replacing` is set when the target asset existed before the import, so finding it
    /// afterwards says nothing about whether this import worked.
    async fn import(&self, task: &ImportTask, replacing: bool) -> Result<ImportReport, AppError>;
    async fn rename_asset(&self, from: &str, to: &str) -> Result<(), AppError>;
    /// Points every reference to `duplicate` at `keep`, then removes `duplicate`.
    async fn consolidate_assets(&self, keep: &str, duplicate: &str) -> Result<(), AppError>;
    /// Removes the folder and its assets from the asset registry.
    async fn delete_directory(&self, path: &str) -> Result<(), AppError>;
    /// Removes the folder's backing directory from the project's content directory.
    async fn delete_directory_on_disk(&self, path: &str) -> Result<(), AppError>;
    async fn set_complex_as_simple(&self, mesh_path: &str) -> Result<(), AppError>;
    async fn list_assets(&self, folder: &str) -> Result<Vec<ImportedObject>, AppError>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum HostRequest<'a> {
    AssetExists { path: &'a str },
    DirectoryExists { path: &'a str },
    MakeDirectory { path: &'a str },
    Import { task: &'a ImportTask },
    RenameAsset { from: &'a str, to: &'a str },
    ConsolidateAssets { keep: &'a str, duplicate: &'a str },
    DeleteDirectory { path: &'a str },
    DeleteDirectoryOnDisk { path: &'a str },
    SetComplexAsSimple { path: &'a str },
    ListAssets { path: &'a str },
}

fn dispatch_payload(request: &HostRequest<'_>) -> Result<CommandPayload, AppError> {
    Ok(CommandPayload::ExecuteStatement(DISPATCH_CALL.render(request)?))
}

/// Finds the last result line in a command's output and decodes it.
pub fn decode_reply<T: DeserializeOwned>(output: &[OutputLine]) -> Result<Option<T>, serde_json::Error> {
    match output.iter().rev().find_map(|line| line.text.strip_prefix(RESULT_PREFIX)) {
        Some(json) => serde_json::from_str(json.trim()).map(Some),
        None => Ok(None),
    }
}

/// Object paths named on the last success line of an import, if it printed one.
fn imported_paths(output: &[OutputLine]) -> Vec<String> {
    let Some(list) = output.iter().rev().find_map(|line| line.text.trim().strip_prefix(IMPORTED_PREFIX)) else {
        return Vec::new();
    };
    serde_json::from_str(list.trim()).unwrap_or_else(|e| {
        debug!(line = %list, error = %e, "Unreadable import success line");
        Vec::new()
    })
}

/// Re-queries the registry for the expected asset after a reported failure.
pub struct AssetPresent {
    path: String,
}

impl AssetPresent {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SuccessEvidence for AssetPresent {
    fn name(&self) -> &str {
        "asset-existence-check"
    }

    async fn confirms_success(&self, sink: &dyn CommandSink, _output: &[OutputLine]) -> bool {
        let payload = match dispatch_payload(&HostRequest::AssetExists { path: &self.path }) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        match sink.submit(&payload, CompletionMode::AwaitResult).await {
            Ok(Some(result)) if result.success => {
                matches!(decode_reply::<bool>(&result.output), Ok(Some(true)))
            }
            Ok(_) => false,
            Err(e) => {
                debug!(path = %self.path, error = %e, "Existence re-check failed");
                false
            }
        }
    }
}

/// Drives the asset operations through the editor's Python interpreter.
///
/// A small dispatcher is installed once per session; each operation after that
/// is a single statement carrying its arguments as a JSON literal.
pub struct RemoteAssetHost<'a> {
    executor: CommandExecutor<'a>,
    installed: OnceCell<()>,
    transcript: StdMutex<Vec<OutputLine>>,
}

impl<'a> RemoteAssetHost<'a> {
    pub fn new(executor: CommandExecutor<'a>) -> Self {
        Self { executor, installed: OnceCell::new(), transcript: StdMutex::new(Vec::new()) }
    }

    /// Editor output of the imports run so far, without dispatcher result lines.
    pub fn take_transcript(&self) -> Vec<OutputLine> {
        let mut transcript = self.transcript.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *transcript)
    }

    async fn ensure_installed(&self) -> Result<(), AppError> {
        self.installed
            .get_or_try_init(|| async {
                info!(session_id = %self.executor.sink().session_id(), "Installing asset dispatcher");
                self.executor
                    .run(CommandPayload::ExecuteFile(DISPATCHER.to_string()), &[])
                    .await
                    .map(|_| ())
            })
            .await?;
        Ok(())
    }

    /// Looks up the classes of the objects the success line names. Nothing else in the folder counts.
    async fn recover_objects(&self, task: &ImportTask, output: &[OutputLine]) -> Result<Vec<ImportedObject>, AppError> {
        let produced = imported_paths(output);
        if produced.is_empty() {
            return Ok(Vec::new());
        }
        let listed = self.list_assets(&task.destination_path).await?;
        Ok(listed
            .into_iter()
            .filter(|object| produced.iter().any(|path| package_path(path) == package_path(&object.path)))
            .collect())
    }

    async fn call<T: DeserializeOwned>(&self, request: HostRequest<'_>) -> Result<T, AppError> {
        self.ensure_installed().await?;
        let execution = self.executor.run(dispatch_payload(&request)?, &[]).await?;
        let seq = execution.result.id.seq;
        match decode_reply(&execution.result.output) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(AppError::ProtocolDecode {
                seq,
                reason: format!("No result line in reply to {:?}", request),
                retriable: false,
                output: execution.result.output,
            }),
            Err(e) => Err(AppError::ProtocolDecode {
                seq,
                reason: e.to_string(),
                retriable: false,
                output: execution.result.output,
            }),
        }
    }
}

#[async_trait]
impl<'a> AssetHost for RemoteAssetHost<'a> {
    async fn asset_exists(&self, path: &str) -> Result<bool, AppError> {
        self.call(HostRequest::AssetExists { path }).await
    }

    async fn directory_exists(&self, path: &str) -> Result<bool, AppError> {
        self.call(HostRequest::DirectoryExists { path }).await
    }

    async fn make_directory(&self, path: &str) -> Result<(), AppError> {
        let created: bool = self.call(HostRequest::MakeDirectory { path }).await?;
        if !created {
            return Err(AppError::Reconciliation(format!("Editor refused to create {}", path)));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(file = %task.filename, destination = %task.destination_path))]
    async fn import(&self, task: &ImportTask, replacing: bool) -> Result<ImportReport, AppError> {
        self.ensure_installed().await?;
        let marker = OutputMarker::new("import-success-marker", IMPORT_SUCCESS_MARKER)?;
        let present = AssetPresent::new(join_content(&task.destination_path, &task.destination_name));
        let mut evidence: Vec<&dyn SuccessEvidence> = Vec::with_capacity(2);
        evidence.push(&marker);
        if !replacing {
            evidence.push(&present);
        }
        let execution = self
            .executor
            .run(dispatch_payload(&HostRequest::Import { task })?, &evidence)
            .await?;
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(execution.result.output.iter().filter(|line| !line.text.starts_with(RESULT_PREFIX)).cloned());

        let objects = match decode_reply::<Vec<ImportedObject>>(&execution.result.output) {
            Ok(Some(objects)) => objects,
            // The exception can land before the result line; fall back to the success line.
            _ if execution.downgraded => self.recover_objects(task, &execution.result.output).await?,
            Ok(None) => {
                return Err(AppError::ProtocolDecode {
                    seq: execution.result.id.seq,
                    reason: "Import reply carried no result line".to_string(),
                    retriable: false,
                    output: execution.result.output,
                })
            }
            Err(e) => return Err(AppError::Json(e)),
        };
        Ok(ImportReport { objects, warnings: execution.warnings })
    }

    async fn rename_asset(&self, from: &str, to: &str) -> Result<(), AppError> {
        self.call::<bool>(HostRequest::RenameAsset { from, to }).await.map(|_| ())
    }

    async fn consolidate_assets(&self, keep: &str, duplicate: &str) -> Result<(), AppError> {
        self.call::<bool>(HostRequest::ConsolidateAssets { keep, duplicate }).await.map(|_| ())
    }

    async fn delete_directory(&self, path: &str) -> Result<(), AppError> {
        self.call::<bool>(HostRequest::DeleteDirectory { path }).await.map(|_| ())
    }

    async fn delete_directory_on_disk(&self, path: &str) -> Result<(), AppError> {
        let removed: bool = self.call(HostRequest::DeleteDirectoryOnDisk { path }).await?;
        debug!(path = %path, removed, "On-disk folder cleanup");
        Ok(())
    }

    async fn set_complex_as_simple(&self, mesh_path: &str) -> Result<(), AppError> {
        self.call::<bool>(HostRequest::SetComplexAsSimple { path: mesh_path }).await.map(|_| ())
    }

    async fn list_assets(&self, folder: &str) -> Result<Vec<ImportedObject>, AppError> {
        self.call(HostRequest::ListAssets { path: folder }).await
    }
}
