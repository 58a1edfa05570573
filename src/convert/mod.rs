use crate::config::Config;
use crate::error::AppError;
use crate::utils::line_ending_handler::split_output_lines;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

const BUNDLED_SCRIPT: &str = include_str!("blender_process.py");
const WINDOWS_INSTALL_ROOT: &str = r"C:\Program Files\Blender Foundation";
const STEAM_BLENDER: &str = r"C:\Program Files (x86)\Steam\steamapps\common\Blender\blender.exe";
const LOG_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvertRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Fraction of polygons kept; 1.0 leaves meshes untouched.
    pub decimate_ratio: f32,
    pub merge_children: bool,
}

impl ConvertRequest {
    pub fn new(input: PathBuf, output: PathBuf, decimate_ratio: f32, merge_children: bool) -> Result<Self, AppError> {
        if !decimate_ratio.is_finite() || !(0.0..=1.0).contains(&decimate_ratio) {
            return Err(AppError::InvalidInput(format!(
                "Decimate ratio must be between 0.0 and 1.0, got {}",
                decimate_ratio
            )));
        }
        Ok(Self { input, output, decimate_ratio, merge_children })
    }
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub output: PathBuf,
    pub output_bytes: u64,
    /// Last lines the converter printed.
    pub log_tail: Vec<String>,
    pub elapsed: Duration,
}

/// Finds a Blender executable: configured path, Windows installs (newest first), `PATH`, Steam.
pub fn find_blender(configured: Option<&Path>) -> Option<PathBuf> {
    let (install_root, steam) = if cfg!(windows) {
        (Some(Path::new(WINDOWS_INSTALL_ROOT)), Some(Path::new(STEAM_BLENDER)))
    } else {
        (None, None)
    };
    search_blender(configured, install_root, steam, || which::which("blender").ok())
}

fn search_blender(
    configured: Option<&Path>,
    install_root: Option<&Path>,
    steam: Option<&Path>,
    on_path: impl FnOnce() -> Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "Configured BLENDER_PATH does not exist, searching elsewhere");
    }
    if let Some(found) = install_root.and_then(|root| installed_versions(root).into_iter().next()) {
        return Some(found);
    }
    if let Some(found) = on_path() {
        return Some(found);
    }
    steam.filter(|p| p.is_file()).map(Path::to_path_buf)
}

/// `Blender X.Y/blender.exe` under an install root, highest version first.
fn installed_versions(root: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut found: Vec<(Vec<u32>, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let version = name.strip_prefix("Blender ")?;
            let executable = entry.path().join("blender.exe");
            if !executable.is_file() {
                return None;
            }
            let key = version.split('.').map(|part| part.trim().parse::<u32>().unwrap_or(0)).collect();
            Some((key, executable))
        })
        .collect();
    found.sort_by_key(|(version, _)| Reverse(version.clone()));
    found.into_iter().map(|(_, path)| path).collect()
}

#[derive(Debug, Clone)]
pub struct BlenderConverter {
    executable: PathBuf,
    script: Option<PathBuf>,
    timeout: Duration,
}

impl BlenderConverter {
    pub fn new(executable: PathBuf, script: Option<PathBuf>, timeout: Duration) -> Self {
        Self { executable, script, timeout }
    }

    pub fn locate(config: &Config) -> Result<Self, AppError> {
        let executable = find_blender(config.blender_path.as_deref()).ok_or_else(|| {
            AppError::ConverterNotFound("Blender not found. Install Blender or set BLENDER_PATH.".to_string())
        })?;
        info!(blender = %executable.display(), "Found Blender");
        Ok(Self::new(executable, config.blender_script.clone(), config.convert_timeout))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    #[instrument(skip(self), fields(input = %request.input.display(), ratio = request.decimate_ratio))]
    pub async fn convert(&self, request: &ConvertRequest) -> Result<Conversion, AppError> {
        if !request.input.is_file() {
            return Err(AppError::InvalidInput(format!("Input file not found: {}", request.input.display())));
        }
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Held until the process exits so the bundled script stays on disk.
        let mut bundled = None;
        let script = match &self.script {
            Some(path) => path.clone(),
            None => {
                let file = tempfile::Builder::new().prefix("blender_process_").suffix(".py").tempfile()?;
                tokio::fs::write(file.path(), BUNDLED_SCRIPT).await?;
                let path = file.path().to_path_buf();
                bundled = Some(file);
                path
            }
        };

        let mut cmd = TokioCommand::new(&self.executable);
        cmd.arg("--background")
            .arg("--python")
            .arg(&script)
            .arg("--")
            .arg("--input")
            .arg(&request.input)
            .arg("--output")
            .arg(&request.output)
            .arg("--decimate")
            .arg(request.decimate_ratio.to_string());
        if request.merge_children {
            cmd.arg("--merge-children");
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        debug!(command = ?cmd, "Launching Blender");

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            error!(blender = %self.executable.display(), error = %e, "Failed to spawn Blender");
            AppError::ConversionFailed(format!("Failed to start Blender: {}", e))
        })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AppError::ConversionFailed(format!("Failed to read Blender output: {}", e))),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Blender timed out");
                return Err(AppError::ConversionFailed(format!(
                    "Blender did not finish within {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        drop(bundled);

        let stdout_lines = split_output_lines(&String::from_utf8_lossy(&output.stdout));
        let log_tail = stdout_lines[stdout_lines.len().saturating_sub(LOG_TAIL_LINES)..].to_vec();

        if !output.status.success() {
            let stderr_lines = split_output_lines(&String::from_utf8_lossy(&output.stderr));
            let detail = stderr_lines[stderr_lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n");
            error!(status = ?output.status, stderr = %detail, "Blender exited with an error");
            return Err(AppError::ConversionFailed(format!("Blender exited with {}: {}", output.status, detail)));
        }

        let output_bytes = match tokio::fs::metadata(&request.output).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(AppError::ConversionFailed("Blender did not produce FBX output".to_string())),
        };

        let elapsed = started.elapsed();
        info!(output = %request.output.display(), bytes = output_bytes, elapsed_ms = elapsed.as_millis() as u64, "Conversion complete");
        Ok(Conversion { output: request.output.clone(), output_bytes, log_tail, elapsed })
    }
}
