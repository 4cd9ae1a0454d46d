//! CLI command abstraction shared by the container daemon and cluster adapters.
//!
//! Both adapters talk to their control plane through a command-line client
//! (`docker`/`podman`, `kubectl`). This builder runs the client asynchronously,
//! optionally feeds stdin, and turns failures into the error taxonomy so the
//! lifecycle layer can decide whether to retry.

use devenv_core::{DevEnvError, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Raw result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Builder for control-plane CLI invocations.
#[derive(Debug, Clone)]
pub struct CliCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl CliCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Add a single argument to the command.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pipe `input` to the process' stdin (e.g. manifests for `kubectl apply -f -`).
    pub fn stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Run and return the output whatever the exit status.
    pub async fn output(self) -> Result<CommandOutput> {
        debug!(program = %self.program, args = ?self.args, "executing command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            // A timed-out call drops this future; the child must not outlive it.
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                DevEnvError::Config(format!("executable '{}' not found", self.program))
            }
            _ => DevEnvError::transient(format!("failed to spawn {}: {e}", self.program)),
        })?;

        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run and return stdout, or a classified error on non-zero exit.
    pub async fn execute_with_output(self) -> Result<String> {
        let program = self.program.clone();
        let output = self.output().await?;
        if output.success {
            Ok(output.stdout)
        } else {
            warn!(program = %program, stderr = %output.stderr, "command failed");
            Err(classify_failure(&program, &output.stderr))
        }
    }

    /// Run for side effects only.
    pub async fn execute(self) -> Result<()> {
        self.execute_with_output().await.map(|_| ())
    }
}

/// Map CLI stderr onto the error taxonomy.
pub fn classify_failure(program: &str, stderr: &str) -> DevEnvError {
    let lower = stderr.to_lowercase();
    if lower.contains("exceeded quota")
        || lower.contains("quota exceeded")
        || lower.contains("insufficient")
        || lower.contains("no space left")
    {
        DevEnvError::QuotaExceeded(format!("{program}: {stderr}"))
    } else if lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("notfound")
        || lower.contains("not found")
    {
        DevEnvError::NotFound(format!("{program}: {stderr}"))
    } else {
        DevEnvError::transient(format!("{program}: {stderr}"))
    }
}

/// Treat "already gone" as success for idempotent teardown calls.
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(DevEnvError::NotFound(_)) => Ok(()),
        other => other,
    }
}
