use crate::error::{AppError, ImportWarning};
use crate::protocol::message::{CommandPayload, CommandResult, CompletionMode, OutputLine};
use crate::utils::command_journal::CommandJournal;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

/// Where the rendered parameter literal goes in a script body.
pub const PARAMS_PLACEHOLDER: &str = "__BRIDGE_PARAMS__";

/// Anything that can submit commands to an editor.
#[async_trait]
pub trait CommandSink: Send + Sync {
    fn session_id(&self) -> &str;

    async fn submit(
        &self,
        payload: &CommandPayload,
        mode: CompletionMode,
    ) -> Result<Option<CommandResult>, AppError>;
}

/// Independent confirmation that an operation finished even though the editor reported an exception.
#[async_trait]
pub trait SuccessEvidence: Send + Sync {
    fn name(&self) -> &str;

    async fn confirms_success(&self, sink: &dyn CommandSink, output: &[OutputLine]) -> bool;
}

/// Looks for a known marker line in the command's own output.
#[derive(Debug, Clone)]
pub struct OutputMarker {
    name: String,
    pattern: Regex,
}

impl OutputMarker {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, AppError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AppError::InvalidInput(format!("Invalid success marker '{}': {}", pattern, e)))?;
        Ok(Self { name: name.into(), pattern })
    }
}

#[async_trait]
impl SuccessEvidence for OutputMarker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn confirms_success(&self, _sink: &dyn CommandSink, output: &[OutputLine]) -> bool {
        output.iter().any(|line| self.pattern.is_match(&line.text))
    }
}

/// A script body plus its structured parameters, serialized by the client.
#[derive(Debug, Clone, Copy)]
pub struct RemoteScript {
    pub name: &'static str,
    pub body: &'static str,
}

impl RemoteScript {
    /// Substitutes parameters as a quoted JSON document the script decodes itself.
    ///
    /// A JSON string literal is also a valid Python string literal, so no
    /// caller-controlled text is ever spliced into code.
    pub fn render<P: Serialize + ?Sized>(&self, params: &P) -> Result<String, AppError> {
        if !self.body.contains(PARAMS_PLACEHOLDER) {
            return Err(AppError::InvalidInput(format!(
                "Script '{}' has no parameter placeholder",
                self.name
            )));
        }
        let document = serde_json::to_string(params)?;
        let literal = serde_json::to_string(&document)?;
        Ok(self.body.replace(PARAMS_PLACEHOLDER, &literal))
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub result: CommandResult,
    pub warnings: Vec<ImportWarning>,
    /// True when a remote failure was accepted on the strength of success evidence.
    pub downgraded: bool,
}

pub struct CommandExecutor<'a> {
    sink: &'a dyn CommandSink,
    journal: Option<&'a CommandJournal>,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(sink: &'a dyn CommandSink) -> Self {
        Self { sink, journal: None }
    }

    pub fn with_journal(mut self, journal: &'a CommandJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn sink(&self) -> &'a dyn CommandSink {
        self.sink
    }

    pub async fn run_script<P: Serialize + Sync + ?Sized>(
        &self,
        script: &RemoteScript,
        params: &P,
        evidence: &[&dyn SuccessEvidence],
    ) -> Result<Execution, AppError> {
        let payload = CommandPayload::ExecuteFile(script.render(params)?);
        self.run(payload, evidence).await
    }

    /// Submits and waits, tolerating a failure the evidence shows happened after success.
    #[instrument(skip_all, fields(session_id = %self.sink.session_id(), kind = payload.kind_str()))]
    pub async fn run(
        &self,
        payload: CommandPayload,
        evidence: &[&dyn SuccessEvidence],
    ) -> Result<Execution, AppError> {
        if let Some(journal) = self.journal {
            journal.record(self.sink.session_id(), &payload).await;
        }

        let result = match self.sink.submit(&payload, CompletionMode::AwaitResult).await? {
            Some(result) => result,
            None => {
                return Err(AppError::RemoteExecution {
                    message: "Editor returned no result for an awaited command".to_string(),
                    output: Vec::new(),
                })
            }
        };

        if result.success {
            debug!(command = %result.id, lines = result.output.len(), "Command succeeded");
            return Ok(Execution { result, warnings: Vec::new(), downgraded: false });
        }

        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "Remote command reported failure".to_string());

        for policy in evidence {
            if policy.confirms_success(self.sink, &result.output).await {
                warn!(
                    command = %result.id,
                    policy = policy.name(),
                    error = %message,
                    "Remote raised after the operation completed; downgrading to warning"
                );
                let warning = AppError::RemoteExecutionWarning {
                    message: format!("{} (confirmed by {})", message, policy.name()),
                };
                return Ok(Execution { result, warnings: vec![warning.into()], downgraded: true });
            }
        }

        error!(command = %result.id, error = %message, policies = evidence.len(), "Remote command failed");
        Err(AppError::RemoteExecution { message, output: result.output })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    const SCRIPT: RemoteScript = RemoteScript {
        name: "echo",
        body: "import json\nparams = json.loads(__BRIDGE_PARAMS__)\n",
    };

    fn marker() -> OutputMarker {
        OutputMarker::new("import-marker", r"^Successfully imported").unwrap()
    }

    #[test]
    fn params_render_as_quoted_json() {
        let rendered = SCRIPT.render(&json!({"path": "C:/a \"b\"\n", "n": 1})).unwrap();
        let literal = rendered
            .strip_prefix("import json\nparams = json.loads(")
            .and_then(|rest| rest.strip_suffix(")\n"))
            .unwrap();
        let document: String = serde_json::from_str(literal).unwrap();
        let params: serde_json::Value = serde_json::from_str(&document).unwrap();
        assert_eq!(params["path"], "C:/a \"b\"\n");
        assert!(!literal.contains('\n'));
    }

    #[test]
    fn script_without_placeholder_is_rejected() {
        let script = RemoteScript { name: "bare", body: "print(1)" };
        assert!(script.render(&json!({})).is_err());
    }

    #[tokio::test]
    async fn success_passes_through() {
        let sink = ScriptedSink::new(vec![respond(|_| Ok(Some(reply(true, &["done"], None, None))))]);
        let execution = CommandExecutor::new(&sink).run_script(&SCRIPT, &json!({}), &[]).await.unwrap();
        assert!(!execution.downgraded);
        assert!(execution.warnings.is_empty());
        assert!(matches!(&sink.sent.lock().unwrap()[0], CommandPayload::ExecuteFile(_)));
    }

    #[tokio::test]
    async fn failure_after_success_marker_is_a_warning() {
        let sink = ScriptedSink::new(vec![respond(|_| {
            Ok(Some(reply(
                false,
                &["LogFbx: importing", "Successfully imported: ['/Game/Imports/Rock.Rock']"],
                None,
                Some("RemoteExecution timed out waiting for editor tick"),
            )))
        })]);
        let marker = marker();
        let execution = CommandExecutor::new(&sink)
            .run_script(&SCRIPT, &json!({}), &[&marker])
            .await
            .unwrap();
        assert!(execution.downgraded);
        assert_eq!(execution.warnings.len(), 1);
        assert_eq!(execution.warnings[0].kind, crate::error::WarningKind::RemoteExecution);
        assert!(execution.warnings[0].message.contains("import-marker"));
    }

    #[tokio::test]
    async fn failure_without_evidence_propagates_with_output() {
        let sink = ScriptedSink::new(vec![respond(|_| {
            Ok(Some(reply(false, &["LogFbx: bad header"], None, Some("ImportError"))))
        })]);
        let marker = marker();
        let err = CommandExecutor::new(&sink)
            .run_script(&SCRIPT, &json!({}), &[&marker])
            .await
            .unwrap_err();
        match &err {
            AppError::RemoteExecution { message, .. } => assert_eq!(message, "ImportError"),
            other => panic!("expected remote failure, got {:?}", other),
        }
        assert_eq!(err.partial_output()[0].text, "LogFbx: bad header");
    }

    #[tokio::test]
    async fn transport_errors_are_not_downgraded() {
        let sink = ScriptedSink::new(vec![respond(|_| {
            Err(AppError::CommandTimeout { seq: 1, waited_ms: 10, output: vec![OutputLine::info("Successfully imported")] })
        })]);
        let marker = marker();
        let err = CommandExecutor::new(&sink)
            .run(CommandPayload::ExecuteStatement("x".into()), &[&marker])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn journal_records_each_command() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CommandJournal::new(dir.path().join("j.log"), 1 << 20);
        let sink = ScriptedSink::new(vec![respond(|_| Ok(Some(reply(true, &[], None, None))))]);
        CommandExecutor::new(&sink)
            .with_journal(&journal)
            .run(CommandPayload::ExecuteStatement("1".into()), &[])
            .await
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("j.log")).unwrap();
        assert!(text.contains("fake"));
    }
}
