//! Agent abstraction for automated phase execution.
//!
//! The [`Agent`] trait decouples the execution lane from the actual reasoning
//! backend (by default `codex exec`). Tests use scripted agents that return
//! predetermined replies without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// JSON Schema the agent output must conform to.
    pub schema_path: PathBuf,
    /// Maximum time to wait for the agent to finish.
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory.
    pub output_limit_bytes: usize,
    /// Raised on Ctrl-C; a running agent is killed when it is set.
    pub interrupt: Option<Arc<AtomicBool>>,
}

/// What an agent invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Exit code, `None` when killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl AgentReply {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, as persisted in raw output artifacts.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Abstraction over agent backends.
///
/// Returning `Err` means the agent could not be launched at all; callers treat
/// that the same as a non-zero exit.
pub trait Agent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply>;

    /// Shell-style command line a human can run to reproduce an invocation.
    fn describe(&self, schema_path: &Path) -> String {
        format!("<agent> --output-schema \"{}\" -", schema_path.display())
    }
}

/// Agent that spawns an external executable (`codex exec ...` by default).
///
/// The command line is `<program...> --output-schema <schema> [--model <model>] -`
/// with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: Vec<String>,
    model: Option<String>,
}

impl CommandAgent {
    pub fn new(program: Vec<String>, model: Option<String>) -> Result<Self> {
        if program.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("agent command must be a non-empty array"));
        }
        Ok(Self { program, model })
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.program[0]);
        cmd.args(&self.program[1..])
            .arg("--output-schema")
            .arg(&request.schema_path);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("-").current_dir(&request.workdir);
        cmd
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(program = %self.program[0], timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let output = run_command_with_timeout(
            self.command(request),
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.interrupt.as_deref(),
        )
        .with_context(|| format!("run agent {}", self.program[0]))?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "agent timed out"
            );
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
        } else {
            debug!("agent completed successfully");
        }

        Ok(AgentReply {
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }

    fn describe(&self, schema_path: &Path) -> String {
        let mut parts = self.program.clone();
        parts.push("--output-schema".to_string());
        parts.push(format!("\"{}\"", schema_path.display()));
        if let Some(model) = &self.model {
            parts.push("--model".to_string());
            parts.push(model.clone());
        }
        parts.push("-".to_string());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            workdir: dir.to_path_buf(),
            prompt: "judge this".to_string(),
            schema_path: dir.join("schema.json"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            interrupt: None,
        }
    }

    fn sh_agent(script: &str) -> CommandAgent {
        CommandAgent::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            None,
        )
        .expect("agent")
    }

    /// The schema path and trailing `-` arrive as positional args; the prompt on stdin.
    #[test]
    fn passes_schema_argument_and_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh_agent(r#"printf '%s|%s|%s|' "$0" "$1" "$2"; cat"#);
        let reply = agent.invoke(&request(temp.path())).expect("invoke");

        assert!(reply.succeeded());
        let schema = temp.path().join("schema.json");
        assert_eq!(
            reply.stdout,
            format!("--output-schema|{}|-|judge this", schema.display())
        );
    }

    #[test]
    fn nonzero_exit_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh_agent("echo oops >&2; exit 4");
        let reply = agent.invoke(&request(temp.path())).expect("invoke");
        assert!(!reply.succeeded());
        assert_eq!(reply.exit_code, Some(4));
        assert_eq!(reply.combined(), "\noops\n");
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent =
            CommandAgent::new(vec!["/nonexistent/agent-binary".to_string()], None).expect("agent");
        assert!(agent.invoke(&request(temp.path())).is_err());
    }

    #[test]
    fn rejects_empty_command() {
        assert!(CommandAgent::new(Vec::new(), None).is_err());
        assert!(CommandAgent::new(vec![" ".to_string()], None).is_err());
    }

    #[test]
    fn describe_includes_model() {
        let agent = CommandAgent::new(
            vec!["codex".to_string(), "exec".to_string()],
            Some("m1".to_string()),
        )
        .expect("agent");
        let text = agent.describe(std::path::Path::new("/s.json"));
        assert_eq!(text, "codex exec --output-schema \"/s.json\" --model m1 -");
    }
}
