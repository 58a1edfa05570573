use crate::protocol::message::OutputLine;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("No editor instance found within {waited_ms} ms (is the editor running with remote execution enabled?)")]
    DiscoveryTimeout { waited_ms: u64 },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol decode error for command {seq}: {reason}")]
    ProtocolDecode {
        seq: u64,
        reason: String,
        retriable: bool,
        output: Vec<OutputLine>,
    },

    #[error("Command {seq} timed out after {waited_ms} ms")]
    CommandTimeout {
        seq: u64,
        waited_ms: u64,
        output: Vec<OutputLine>,
    },

    #[error("Remote execution failed: {message}")]
    RemoteExecution {
        message: String,
        output: Vec<OutputLine>,
    },

    #[error("Remote execution raised after success: {message}")]
    RemoteExecutionWarning { message: String },

    #[error("Reconciliation step failed: {0}")]
    Reconciliation(String),

    #[error("Session {session_id} closed before command {seq} completed")]
    SessionClosed {
        session_id: String,
        seq: u64,
        output: Vec<OutputLine>,
    },

    #[error("Converter not found: {0}")]
    ConverterNotFound(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Invalid input argument: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

/// Classification surfaced at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DiscoveryTimeout,
    ConnectionFailed,
    ProtocolDecode,
    CommandTimeout,
    RemoteExecution,
    RemoteExecutionWarning,
    Reconciliation,
    Cancelled,
    Conversion,
    InvalidInput,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::DiscoveryTimeout { .. } => ErrorKind::DiscoveryTimeout,
            AppError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            AppError::ProtocolDecode { .. } => ErrorKind::ProtocolDecode,
            AppError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            AppError::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            AppError::RemoteExecutionWarning { .. } => ErrorKind::RemoteExecutionWarning,
            AppError::Reconciliation(_) => ErrorKind::Reconciliation,
            AppError::SessionClosed { .. } => ErrorKind::Cancelled,
            AppError::ConverterNotFound(_) | AppError::ConversionFailed(_) => ErrorKind::Conversion,
            AppError::InvalidInput(_) => ErrorKind::InvalidInput,
            AppError::Io(_) | AppError::Json(_) | AppError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Output already received for the failed command, in arrival order.
    pub fn partial_output(&self) -> &[OutputLine] {
        match self {
            AppError::ProtocolDecode { output, .. }
            | AppError::CommandTimeout { output, .. }
            | AppError::RemoteExecution { output, .. }
            | AppError::SessionClosed { output, .. } => output,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    RemoteExecution,
    Reconciliation,
}

/// A non-fatal problem attached to a still-successful import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl ImportWarning {
    pub fn remote(message: impl Into<String>) -> Self {
        Self { kind: WarningKind::RemoteExecution, message: message.into() }
    }

    pub fn reconciliation(message: impl Into<String>) -> Self {
        Self { kind: WarningKind::Reconciliation, message: message.into() }
    }
}

impl From<AppError> for ImportWarning {
    fn from(err: AppError) -> Self {
        match err {
            AppError::RemoteExecutionWarning { message } => ImportWarning::remote(message),
            other => ImportWarning::reconciliation(other.to_string()),
        }
    }
}
