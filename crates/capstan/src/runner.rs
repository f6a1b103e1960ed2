//! Opaque command execution: shell out, capture output, enforce the timeout.
//!
//! The runner never returns an error. A command that cannot be spawned, or
//! that outlives its timeout, reports exit code `-1` with the message in the
//! stderr slot; the worker feeds every outcome into the same retry/dead
//! decision, so "could not run" and "ran and failed" travel the same path.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// What one execution produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn not_run(message: String) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// The boundary between the worker loop and the operating system.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> RunOutput;
}

/// Runs commands through the platform shell (`sh -c`, or `cmd /C` on
/// Windows).
///
/// A timed-out command is killed when its future is dropped; the worker does
/// not wait past the timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Duration) -> RunOutput {
        let mut shell = if cfg!(windows) {
            let mut shell = Command::new("cmd");
            shell.arg("/C").arg(command);
            shell
        } else {
            let mut shell = Command::new("sh");
            shell.arg("-c").arg(command);
            shell
        };
        shell
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match shell.spawn() {
            Ok(child) => child,
            Err(e) => return RunOutput::not_run(format!("command spawn error: {e}")),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = RunOutput {
                    exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                debug!(
                    exit_code = result.exit_code,
                    stdout_len = result.stdout.len(),
                    stderr_len = result.stderr.len(),
                    "command finished"
                );
                result
            }
            Ok(Err(e)) => RunOutput::not_run(format!("command execution error: {e}")),
            Err(_) => RunOutput::not_run(format!("command timeout: {command}")),
        }
    }
}
