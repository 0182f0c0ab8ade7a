use std::process::ExitStatus;
use std::time::Duration;

/// Errors that can occur while driving a bhyve machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("{program} failed ({status}): {stderr}")]
    ExternalToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("VM is not running")]
    NotRunning,

    #[error("VM is already running")]
    AlreadyRunning,

    #[error("boot loader did not come up for '{vm}' after {attempts} attempts")]
    BootLoaderExhausted { vm: String, attempts: u32 },

    #[error("failed to destroy '{vm}' after {attempts} attempts")]
    DestroyExhausted { vm: String, attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("feature not supported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn tool_failed(program: &str, status: ExitStatus, stderr: &[u8]) -> Self {
        Error::ExternalToolFailed {
            program: program.to_string(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    pub fn timeout_after(what: &str, elapsed: Duration) -> Self {
        Error::Timeout(format!("{what} after {elapsed:?}"))
    }

    /// Whether an orchestrator may reasonably retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceBusy(_)
                | Error::Timeout(_)
                | Error::BootLoaderExhausted { .. }
                | Error::DestroyExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
