use bhyvm_core::Result;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive `flock(2)` on a file in the store, held until dropped.
///
/// Serializes shared provisioning (bridge, DHCP) between concurrent driver
/// processes. The lock file itself is never removed.
#[derive(Debug)]
pub struct ProvisionLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl ProvisionLock {
    /// Blocks (on the blocking pool) until the lock is acquired.
    pub async fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(std::io::Error::other)?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        debug!("waiting for {}", path.display());
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from(errno))?;
        debug!("acquired {}", path.display());
        Ok(Self { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
