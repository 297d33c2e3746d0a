//! External command execution layer
//!
//! Every provisioning side effect goes through an external tool
//! (`cryptsetup`, `docker`, `systemctl`, `apt-get`). The [`CommandRunner`]
//! trait splits invocations into read-only probes (`run`) and state-changing
//! commands (`apply`) so that `--dry-run` can keep probing the real host
//! while suppressing mutations.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::types::ExternalToolError;

/// Maximum bytes of captured output kept per stream.
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// Default per-command timeout. Package installation and image pulls are the
/// slow cases; external tools own their lifecycle once invoked, so the only
/// recourse on overrun is to give up and report.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

/// Render a command line for logs and error messages.
pub fn render_command(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Executes external commands on behalf of the provisioning components.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a read-only probe command. Never mutates host state.
    async fn run(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError>;

    /// Run a state-changing command. Suppressed under dry-run.
    async fn apply(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError>;

    fn is_dry_run(&self) -> bool {
        false
    }

    /// Probe variant that treats a non-zero exit as an error.
    async fn run_ok(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        let out = self.run(program, args).await?;
        into_tool_result(program, args, out)
    }

    /// Mutating variant that treats a non-zero exit as an error.
    async fn apply_ok(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<ExecOutput, ExternalToolError> {
        let out = self.apply(program, args).await?;
        into_tool_result(program, args, out)
    }
}

fn into_tool_result(
    program: &str,
    args: &[&str],
    out: ExecOutput,
) -> Result<ExecOutput, ExternalToolError> {
    if out.success {
        Ok(out)
    } else {
        Err(ExternalToolError {
            command: render_command(program, args),
            status: Some(out.exit_code),
            stderr: out.stderr,
        })
    }
}

/// Runs commands directly on the host with captured output and a timeout.
#[derive(Debug, Clone)]
pub struct HostRunner {
    command_timeout: Duration,
}

impl HostRunner {
    pub fn new() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn execute(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        let rendered = render_command(program, args);
        tracing::debug!(command = %rendered, "executing");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match timeout(self.command_timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExternalToolError {
                    command: rendered,
                    status: None,
                    stderr: format!("failed to spawn: {}", e),
                });
            }
            Err(_) => {
                return Err(ExternalToolError {
                    command: rendered,
                    status: None,
                    stderr: format!("timed out after {:?}", self.command_timeout),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(ExecOutput {
            exit_code,
            stdout: truncate_output(&output.stdout),
            stderr: truncate_output(&output.stderr),
            success: output.status.success(),
        })
    }
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURED_BYTES {
        text.into_owned()
    } else {
        let mut cut = MAX_CAPTURED_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}… [truncated]", &text[..cut])
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        self.execute(program, args).await
    }

    async fn apply(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        self.execute(program, args).await
    }
}

/// Dry-run wrapper: probes pass through to the host so the reported plan
/// reflects true state, while mutating commands are logged and suppressed.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    inner: HostRunner,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self {
            inner: HostRunner::new(),
        }
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        self.inner.run(program, args).await
    }

    async fn apply(&self, program: &str, args: &[&str]) -> Result<ExecOutput, ExternalToolError> {
        tracing::info!(command = %render_command(program, args), "dry-run: skipping");
        Ok(ExecOutput::success(""))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_runner_captures_stdout() {
        let runner = HostRunner::new();
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_ok_rejects_nonzero_exit() {
        let runner = HostRunner::new();
        let err = runner.run_ok("false", &[]).await.unwrap_err();
        assert_eq!(err.status, Some(1));
        assert!(err.command.starts_with("false"));
    }

    #[tokio::test]
    async fn spawn_failure_reports_no_exit_status() {
        let runner = HostRunner::new();
        let err = runner
            .run("vaulthost-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(err.status.is_none());
        assert!(err.stderr.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn fake_runner_replays_scripted_responses_in_order() {
        let runner = fake::FakeRunner::new();
        runner.script("cryptsetup isLuks /x", ExecOutput::failure(1, ""));
        runner.script("cryptsetup isLuks /x", ExecOutput::success(""));

        let first = runner.run("cryptsetup", &["isLuks", "/x"]).await.unwrap();
        let second = runner.run("cryptsetup", &["isLuks", "/x"]).await.unwrap();
        let third = runner.run("cryptsetup", &["isLuks", "/x"]).await.unwrap();
        assert!(!first.success);
        assert!(second.success);
        // Sticks to the last scripted response once the queue drains.
        assert!(third.success);
    }
}
