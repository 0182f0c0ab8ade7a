//! dnsmasq as the DHCP server on the bridge.
//!
//! The driver only ever writes the config file, once. Whether the daemon runs
//! is judged by its pid file; a stale pid file left by a crashed dnsmasq is
//! taken as "running" and has to be removed by hand.

use crate::host::Host;
use crate::layout::StoreLayout;
use bhyvm_core::{NetworkConfig, Result, args};
use std::io::ErrorKind;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const FIXED_OPTIONS: &[&str] = &[
    "port=0",
    "domain-needed",
    "no-resolv",
    "except-interface=lo0",
    "bind-interfaces",
    "local-service",
    "dhcp-authoritative",
];

#[derive(Debug, Clone)]
pub struct DhcpService {
    host: Host,
    store: StoreLayout,
}

impl DhcpService {
    pub fn new(host: Host, store: StoreLayout) -> Self {
        Self { host, store }
    }

    /// Writes the config unless one exists. Returns whether it was written.
    pub async fn ensure_config(&self, network: &NetworkConfig) -> Result<bool> {
        let path = self.store.dhcp_config();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("{} already exists", path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(render_config(network).as_bytes()).await?;
        file.sync_all().await?;
        info!("wrote DHCP config {}", path.display());
        Ok(true)
    }

    /// Launches dnsmasq unless its pid file exists. Returns whether it was
    /// launched.
    pub async fn ensure_running(&self, network: &NetworkConfig) -> Result<bool> {
        let pid_file = self.store.dhcp_pid();
        if tokio::fs::try_exists(&pid_file).await? {
            debug!("{} exists, assuming dnsmasq is running", pid_file.display());
            return Ok(false);
        }

        info!("starting dnsmasq on {}", network.bridge);
        self.host
            .run_privileged(
                &self.host.tools.dnsmasq,
                args![
                    "-i",
                    network.bridge,
                    "-C",
                    self.store.dhcp_config().display(),
                    "-x",
                    pid_file.display(),
                    "-l",
                    self.store.leases().display(),
                ],
            )
            .await?;
        Ok(true)
    }
}

pub fn render_config(network: &NetworkConfig) -> String {
    let mut config = FIXED_OPTIONS.join("\n");
    config.push_str("\n\n");
    config.push_str(&format!("interface={}\n", network.bridge));
    config.push_str(&format!("dhcp-range={}\n", network.dhcp_range));
    config
}
