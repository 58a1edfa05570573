use crate::protocol::message::CommandPayload;
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_PAYLOAD: usize = 1024;

/// Append-only record of every command sent to an editor, rotated by size.
#[derive(Debug)]
pub struct CommandJournal {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl CommandJournal {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create command journal directory");
                }
            }
        }
        Self { log_file_path, max_size_bytes }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self.log_file_path.file_stem().unwrap_or_default().to_string_lossy();
            let extension = self.log_file_path.extension().unwrap_or_default().to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn record(&self, session_id: &str, payload: &CommandPayload) {
        if let Err(e) = self.try_record(session_id, payload).await {
            error!(session_id = %session_id, error = %e, "Failed to write command journal");
        }
    }

    async fn try_record(&self, session_id: &str, payload: &CommandPayload) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let body = payload.body();
        let shown = if body.len() > MAX_LOGGED_PAYLOAD {
            let mut cut = MAX_LOGGED_PAYLOAD;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}<{} bytes truncated>", &body[..cut], body.len() - cut)
        } else {
            body.to_string()
        };

        let log_entry = format!(
            "{} | {} | {:<17} | {}\n",
            Utc::now().to_rfc3339(),
            session_id,
            payload.kind_str(),
            serde_json::to_string(&shown)?
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
