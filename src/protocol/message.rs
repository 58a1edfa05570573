use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;

pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: &str = "ue_py";

/// Envelope shared by discovery datagrams and command-channel frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub version: u32,
    pub magic: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageBody {
    Ping,
    Pong(NodeInfo),
    OpenConnection {
        command_ip: String,
        command_port: u16,
        session_id: String,
    },
    CloseConnection {
        session_id: String,
    },
    Command {
        session_id: String,
        seq: u64,
        payload: CommandPayload,
        mode: CompletionMode,
    },
    CommandOutput {
        session_id: String,
        seq: u64,
        #[serde(flatten)]
        line: OutputLine,
    },
    CommandResult {
        session_id: String,
        seq: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// What an editor instance says about itself in a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub engine_version: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum CommandPayload {
    /// A complete script body run in the editor's interpreter.
    ExecuteFile(String),
    /// A single expression whose value comes back as the command result.
    ExecuteStatement(String),
}

impl CommandPayload {
    pub fn kind_str(&self) -> &'static str {
        match self {
            CommandPayload::ExecuteFile(_) => "execute_file",
            CommandPayload::ExecuteStatement(_) => "execute_statement",
        }
    }

    pub fn body(&self) -> &str {
        match self {
            CommandPayload::ExecuteFile(body) | CommandPayload::ExecuteStatement(body) => body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    FireAndForget,
    AwaitResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub kind: OutputKind,
    #[serde(rename = "output")]
    pub text: String,
}

impl OutputLine {
    pub fn info(text: impl Into<String>) -> Self {
        Self { kind: OutputKind::Info, text: text.into() }
    }
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OutputKind::Info => write!(f, "{}", self.text),
            OutputKind::Warning => write!(f, "[warning] {}", self.text),
            OutputKind::Error => write!(f, "[error] {}", self.text),
        }
    }
}

/// Unique within one session for the session's whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CommandId {
    pub session_id: String,
    pub seq: u64,
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub id: CommandId,
    pub success: bool,
    pub output: Vec<OutputLine>,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl CommandResult {
    pub fn output_text(&self) -> impl Iterator<Item = &str> {
        self.output.iter().map(|line| line.text.as_str())
    }
}

impl Message {
    pub fn new(source: impl Into<String>, dest: Option<String>, body: MessageBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            magic: PROTOCOL_MAGIC.to_string(),
            source: source.into(),
            dest,
            body,
        }
    }

    /// Foreign traffic on the same group or port is dropped, not treated as an error.
    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION && self.magic == PROTOCOL_MAGIC
    }

    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.dest.as_deref().map_or(true, |dest| dest == node_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
