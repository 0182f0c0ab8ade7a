//! Serial console capture through nmdm device pairs.
//!
//! Each VM gets one `/dev/nmdm<N>` pair: bhyve holds the `A` end as COM1 and
//! a detached logger process reads the `B` end into the machine's console
//! log. The logger is known only by its pid file.

use crate::host::Host;
use bhyvm_core::{Error, MAX_CONSOLE_DEVICES, Result, RetryPolicy, args};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Subcommand of the driver binary that runs the logger loop.
pub const CONSOLE_LOG_COMMAND: &str = "console-log";

/// One `nmdm` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleDevice {
    dev_dir: PathBuf,
    index: u32,
}

impl ConsoleDevice {
    pub fn new(dev_dir: impl Into<PathBuf>, index: u32) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            index,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// End handed to the hypervisor.
    pub fn guest_end(&self) -> PathBuf {
        self.dev_dir.join(format!("nmdm{}A", self.index))
    }

    /// End read by the logger.
    pub fn host_end(&self) -> PathBuf {
        self.dev_dir.join(format!("nmdm{}B", self.index))
    }
}

/// Handle to a detached process through its pid file.
///
/// A missing, unreadable or garbled pid file means the process is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Option<Pid> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    debug!("unreadable pid file {}: {e}", self.path.display());
                }
                return None;
            }
        };
        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
            _ => {
                debug!("garbled pid file {}: {contents:?}", self.path.display());
                None
            }
        }
    }

    pub async fn is_alive(&self) -> bool {
        match self.read().await {
            Some(pid) => matches!(signal::kill(pid, None), Ok(()) | Err(Errno::EPERM)),
            None => false,
        }
    }

    /// Sends SIGKILL and removes the pid file. Returns whether a live
    /// process was signalled.
    pub async fn stop(&self) -> Result<bool> {
        let signalled = match self.read().await {
            Some(pid) => match signal::kill(pid, Signal::SIGKILL) {
                Ok(()) => {
                    debug!("sent SIGKILL to {pid}");
                    true
                }
                Err(Errno::ESRCH) => false,
                Err(errno) => return Err(std::io::Error::from(errno).into()),
            },
            None => false,
        };

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(signalled)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleLogger {
    host: Host,
    worker: PathBuf,
}

impl ConsoleLogger {
    /// `worker` is the driver binary; it is re-executed with
    /// [`CONSOLE_LOG_COMMAND`] as the logger process.
    pub fn new(host: Host, worker: impl Into<PathBuf>) -> Self {
        Self {
            host,
            worker: worker.into(),
        }
    }

    /// Probes `nmdm0`, `nmdm1`, ... for a pair nobody holds open, sleeping
    /// `policy.delay` between busy devices.
    ///
    /// Each attempt probes the next device, so `policy.attempts` is also the
    /// number of pairs searched, capped at [`MAX_CONSOLE_DEVICES`].
    pub async fn find_free_device(&self, policy: &RetryPolicy) -> Result<ConsoleDevice> {
        let policy = RetryPolicy::new(policy.attempts.min(MAX_CONSOLE_DEVICES), policy.delay);
        let found = policy
            .poll(|attempt| {
                let device = ConsoleDevice::new(&self.host.paths.dev_dir, attempt - 1);
                async move {
                    if self.is_busy(&device).await? {
                        debug!("{} is busy", device.guest_end().display());
                        Ok(None)
                    } else {
                        Ok(Some(device))
                    }
                }
            })
            .await?;

        found.ok_or_else(|| {
            Error::ResourceBusy(format!(
                "no free nmdm device among the first {}",
                policy.attempts
            ))
        })
    }

    async fn is_busy(&self, device: &ConsoleDevice) -> Result<bool> {
        let output = self
            .host
            .run_privileged(&self.host.tools.fuser, args![device.guest_end().display()])
            .await?;
        Ok(output.stdout_str().split_whitespace().next().is_some())
    }

    /// Detaches a logger copying the device's host end into `log_file`.
    pub async fn start_logging(
        &self,
        device: &ConsoleDevice,
        log_file: &Path,
        pid_file: &PidFile,
    ) -> Result<()> {
        info!(
            "logging {} to {}",
            device.host_end().display(),
            log_file.display()
        );
        self.host
            .run(
                &self.host.tools.daemon,
                args![
                    "-f",
                    "-p",
                    pid_file.path().display(),
                    self.worker.display(),
                    CONSOLE_LOG_COMMAND,
                    device.host_end().display(),
                    log_file.display(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn stop_logging(&self, pid_file: &PidFile) -> Result<()> {
        if pid_file.stop().await? {
            info!("stopped console logger");
        } else {
            debug!("console logger already stopped");
        }
        Ok(())
    }
}
