//! Lifecycle driver for boot2docker machines on FreeBSD bhyve.
//!
//! A [`Machine`] provisions the host resources a VM needs (bridge with
//! netgraph NAT, dnsmasq, a tap device, an nmdm console pair), boots the
//! guest through grub-bhyve, and discovers its address from the DHCP lease
//! file. None of this is tracked in a database: the host is asked every
//! time.
//!
//! ```rust,no_run
//! use bhyvm::{DriverSettings, Host, Machine};
//! use bhyvm_core::MachineOptions;
//!
//! # async fn example() -> bhyvm_core::Result<()> {
//! let machine = Machine::open("/var/db/bhyvm", "default", Host::system(), DriverSettings::default())?;
//! machine.create(MachineOptions::default()).await?;
//! println!("{}", machine.url().await?);
//! machine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod boot;
pub mod console;
pub mod dhcp;
pub mod discovery;
pub mod disk;
mod host;
mod layout;
mod lock;
mod machine;
pub mod network;
pub mod preflight;

#[cfg(feature = "test-utils")]
pub mod test_utils;

// ============================================================================
// Core API
// ============================================================================

pub use machine::{
    DOCKER_PORT, DriverSettings, Machine, MachineState, current_operator, hypervisor_args,
};

// ============================================================================
// Host access and components
// ============================================================================

pub use boot::BootLoader;
pub use console::{CONSOLE_LOG_COMMAND, ConsoleDevice, ConsoleLogger, PidFile};
pub use dhcp::DhcpService;
pub use discovery::{ReadinessProbe, TcpProbe};
pub use host::{Host, HostInterface, InterfaceTable, SystemInterfaces};
pub use layout::{MachineLayout, StoreLayout};
pub use lock::ProvisionLock;
pub use network::{BridgeSetup, NetworkProvisioner};
