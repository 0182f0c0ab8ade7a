mod host;
mod identity;
mod mac;
mod network;

pub use host::{HostPaths, HostTools};
pub use identity::VmIdentity;
pub use mac::{MAC_PREFIX, MacAddress};
pub use network::{DEFAULT_BRIDGE, DEFAULT_DHCP_RANGE, DEFAULT_SUBNET, DhcpRange, NetworkConfig};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_DISK_SIZE_MB: u64 = 16384;
pub const DEFAULT_MEMORY_MB: u32 = 1024;
pub const DEFAULT_CPUS: u32 = 1;

const MAX_CPUS: u32 = 256;

/// What to do when `start` fails after resources were allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartFailurePolicy {
    /// Kill the VM and reclaim its tap device and console logger.
    #[default]
    Teardown,
    /// Leave whatever is running in place for inspection.
    LeaveRunning,
}

/// Options recognized at machine creation, as read from flags or a config
/// file. Converted into an immutable [`MachineConfig`] once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    pub disk_size_mb: u64,
    pub memory_mb: u32,
    pub cpus: u32,
    pub bridge: String,
    pub subnet: String,
    pub dhcp_range: String,
    /// Local path or `file://` URL of the boot ISO. Defaults to the cached ISO.
    pub boot_image_url: Option<String>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: DEFAULT_CPUS,
            bridge: DEFAULT_BRIDGE.to_string(),
            subnet: DEFAULT_SUBNET.to_string(),
            dhcp_range: DEFAULT_DHCP_RANGE.to_string(),
            boot_image_url: None,
        }
    }
}

impl MachineOptions {
    pub fn network(&self) -> Result<NetworkConfig> {
        NetworkConfig::new(&self.bridge, &self.subnet, &self.dhcp_range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(Error::InvalidConfig("cpus must be at least 1".to_string()));
        }
        if self.cpus > MAX_CPUS {
            return Err(Error::InvalidConfig(format!("cpus cannot exceed {MAX_CPUS}")));
        }
        if self.memory_mb == 0 {
            return Err(Error::InvalidConfig("memory must be at least 1 MB".to_string()));
        }
        if self.disk_size_mb == 0 {
            return Err(Error::InvalidConfig("disk size must be at least 1 MB".to_string()));
        }
        self.disk_size_bytes()?;
        self.network().map(|_| ())
    }

    pub fn disk_size_bytes(&self) -> Result<u64> {
        self.disk_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            Error::InvalidConfig(format!("disk size {} MB is too large", self.disk_size_mb))
        })
    }

    /// Freezes the options into a machine configuration with a fresh MAC.
    pub fn into_config(self, boot_image: PathBuf) -> Result<MachineConfig> {
        self.validate()?;
        Ok(MachineConfig {
            disk_size_bytes: self.disk_size_bytes()?,
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            network: self.network()?,
            mac: MacAddress::generate(),
            boot_image,
        })
    }
}

/// Immutable per-machine configuration, snapshotted at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub disk_size_bytes: u64,
    pub memory_mb: u32,
    pub cpus: u32,
    pub network: NetworkConfig,
    pub mac: MacAddress,
    pub boot_image: PathBuf,
}
