pub mod error;
pub mod exec;
pub mod retry;
pub mod types;

pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner, strip_control};
pub use retry::{RetryPolicies, RetryPolicy};
pub use types::{
    DEFAULT_BRIDGE, DEFAULT_CPUS, DEFAULT_DHCP_RANGE, DEFAULT_DISK_SIZE_MB, DEFAULT_MEMORY_MB,
    DEFAULT_SUBNET, DhcpRange, HostPaths, HostTools, MAC_PREFIX, MacAddress, MachineConfig,
    MachineOptions, NetworkConfig, StartFailurePolicy, VmIdentity,
};

/// Ceiling on nmdm console pairs probed before giving up. This is a bound on
/// the search, not a kernel limit.
pub const MAX_CONSOLE_DEVICES: u32 = 100;
