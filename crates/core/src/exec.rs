//! External command execution.
//!
//! All host mutation funnels through a [`CommandRunner`]. The runner never
//! treats a non-zero exit as an error; callers decide with
//! [`CommandOutput::check`]. There are no retries at this layer.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, as a terminal would show it.
    pub fn combined(&self) -> String {
        let mut out = self.stdout_str();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }

    /// Converts a non-zero exit into [`Error::ExternalToolFailed`].
    pub fn check(self, program: &str) -> Result<Self> {
        if self.status.success() {
            Ok(self)
        } else {
            Err(Error::tool_failed(program, self.status, &self.stderr))
        }
    }
}

/// Runs external programs. Abstracted so the coordinator can be driven by a
/// scripted host in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput>;
}

/// Runs real processes with tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("EXEC: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        let output = CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };
        log_output(&output);
        Ok(output)
    }

    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput> {
        debug!("EXEC: {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit before reading everything; its output decides.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("{program}: stdin closed early: {e}");
            }
        }

        let output = child.wait_with_output().await?;
        let output = CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };
        log_output(&output);
        Ok(output)
    }
}

fn log_output(output: &CommandOutput) {
    debug!("STATUS: {}", output.status);
    debug!("STDOUT: {}", String::from_utf8_lossy(&output.stdout));
    debug!("STDERR: {}", String::from_utf8_lossy(&output.stderr));
}

/// Drops control and non-ASCII bytes so tool output is safe to log.
pub fn strip_control(text: &str) -> String {
    text.chars().filter(|c| (' '..='~').contains(c)).collect()
}

/// Builds an owned argument vector from string-like items.
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$(::std::string::ToString::to_string(&$arg)),*]
    };
}
