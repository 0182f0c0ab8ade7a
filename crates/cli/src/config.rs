//! Optional TOML configuration file.
//!
//! ```toml
//! store = "/var/db/bhyvm"
//! start_failure = "leave-running"
//!
//! [machine]
//! cpus = 2
//! memory_mb = 2048
//!
//! [tools]
//! use_sudo = false
//!
//! [retry.lease]
//! attempts = 90
//! delay = 2000
//! ```
//!
//! Every section is optional; flags given on the command line win over the
//! file.
//!
//! `[retry.console_probe]` probes one nmdm pair per attempt, so lowering its
//! `attempts` also shrinks the range of console devices searched (never
//! beyond 100).

use anyhow::Context;
use bhyvm_core::{HostTools, MachineOptions, RetryPolicies, StartFailurePolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub store: Option<PathBuf>,
    pub start_failure: StartFailurePolicy,
    pub machine: MachineOptions,
    pub tools: HostTools,
    pub retry: RetryPolicies,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// `$HOME/.bhyvm`, where machines live unless told otherwise.
pub fn default_store() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; pass --store")?;
    Ok(PathBuf::from(home).join(".bhyvm"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.store.is_none());
        assert_eq!(config.machine, MachineOptions::default());
        assert_eq!(config.tools, HostTools::default());
        assert_eq!(config.start_failure, StartFailurePolicy::Teardown);
    }

    #[test]
    fn sections_override_defaults() {
        let config: FileConfig = toml::from_str(
            r#"
            store = "/var/db/bhyvm"
            start_failure = "leave-running"

            [machine]
            cpus = 2
            dhcp_range = "192.168.8.50,192.168.8.99"

            [tools]
            use_sudo = false

            [retry.lease]
            attempts = 90
            delay = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.store, Some(PathBuf::from("/var/db/bhyvm")));
        assert_eq!(config.start_failure, StartFailurePolicy::LeaveRunning);
        assert_eq!(config.machine.cpus, 2);
        assert_eq!(config.machine.memory_mb, 1024);
        assert_eq!(config.machine.dhcp_range, "192.168.8.50,192.168.8.99");
        assert!(!config.tools.use_sudo);
        assert_eq!(config.tools.ifconfig, "ifconfig");
        assert_eq!(config.retry.lease.attempts, 90);
        assert_eq!(config.retry.lease.delay, Duration::from_millis(500));
        assert_eq!(config.retry.destroy, RetryPolicies::default().destroy);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("stor = \"/tmp\"").is_err());
    }

    #[test]
    fn load_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhyvm.toml");
        std::fs::write(&path, "[machine]\ncpus = \"many\"\n").unwrap();
        let err = FileConfig::load(&path).unwrap_err();
        assert!(format!("{err}").contains("bhyvm.toml"));
    }
}
