use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const DEFAULT_BRIDGE: &str = "bridge0";
pub const DEFAULT_SUBNET: &str = "192.168.8.1/24";
pub const DEFAULT_DHCP_RANGE: &str = "192.168.8.10,192.168.8.254";

/// Inclusive address range handed to the DHCP daemon, written `start,end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl DhcpRange {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

impl fmt::Display for DhcpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.start, self.end)
    }
}

impl FromStr for DhcpRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid DHCP range '{s}', expected 'start,end'"));
        let (start, end) = s.split_once(',').ok_or_else(invalid)?;
        let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
        let end: Ipv4Addr = end.trim().parse().map_err(|_| invalid())?;
        if start > end {
            return Err(Error::InvalidConfig(format!(
                "DHCP range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for DhcpRange {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DhcpRange> for String {
    fn from(range: DhcpRange) -> Self {
        range.to_string()
    }
}

/// Host-side network shared by every machine on the same bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bridge: String,
    /// Bridge address with prefix, e.g. `192.168.8.1/24`.
    pub subnet: Ipv4Net,
    pub dhcp_range: DhcpRange,
}

impl NetworkConfig {
    pub fn new(bridge: &str, subnet: &str, dhcp_range: &str) -> Result<Self> {
        if bridge.is_empty() {
            return Err(Error::InvalidConfig("bridge name cannot be empty".to_string()));
        }
        let subnet: Ipv4Net = subnet
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid subnet '{subnet}'")))?;
        let dhcp_range: DhcpRange = dhcp_range.parse()?;

        if !subnet.contains(&dhcp_range.start) || !subnet.contains(&dhcp_range.end) {
            return Err(Error::InvalidConfig(format!(
                "DHCP range {dhcp_range} is outside subnet {}",
                subnet.trunc()
            )));
        }

        Ok(Self {
            bridge: bridge.to_string(),
            subnet,
            dhcp_range,
        })
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(192, 168, 8, 1), 24).expect("valid prefix"),
            dhcp_range: DhcpRange {
                start: Ipv4Addr::new(192, 168, 8, 10),
                end: Ipv4Addr::new(192, 168, 8, 254),
            },
        }
    }
}
