//! On-disk layout of the machine store.
//!
//! Everything the driver persists lives under one store root: shared network
//! state at the top, one directory per machine below `machines/`.

use std::path::{Path, PathBuf};

const MACHINES_DIR: &str = "machines";
const CACHE_DIR: &str = "cache";
const BOOT_IMAGE: &str = "boot2docker.iso";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machine(&self, name: &str) -> MachineLayout {
        MachineLayout {
            dir: self.root.join(MACHINES_DIR).join(name),
        }
    }

    pub fn dhcp_config(&self) -> PathBuf {
        self.root.join("dnsmasq.conf")
    }

    pub fn dhcp_pid(&self) -> PathBuf {
        self.root.join("dnsmasq.pid")
    }

    pub fn leases(&self) -> PathBuf {
        self.root.join("bhyve.leases")
    }

    /// Lock serializing bridge and DHCP provisioning for one bridge.
    pub fn bridge_lock(&self, bridge: &str) -> PathBuf {
        self.root.join(format!("{bridge}.lock"))
    }

    /// Boot ISO used when a machine is created without an explicit image.
    pub fn cached_boot_image(&self) -> PathBuf {
        self.root.join(CACHE_DIR).join(BOOT_IMAGE)
    }
}

/// Files owned by a single machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineLayout {
    dir: PathBuf,
}

impl MachineLayout {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join("guest.img")
    }

    pub fn device_map(&self) -> PathBuf {
        self.dir.join("device.map")
    }

    pub fn console_pid(&self) -> PathBuf {
        self.dir.join("nmdm.pid")
    }

    pub fn console_log(&self) -> PathBuf {
        self.dir.join("console.log")
    }

    pub fn boot_image(&self) -> PathBuf {
        self.dir.join(BOOT_IMAGE)
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn tap_record(&self) -> PathBuf {
        self.dir.join("tap.dev")
    }

    pub fn ssh_key(&self) -> PathBuf {
        self.dir.join("id_rsa")
    }

    pub fn ssh_public_key(&self) -> PathBuf {
        self.dir.join("id_rsa.pub")
    }
}
