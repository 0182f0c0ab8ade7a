//! Bridge, NAT and tap device provisioning.
//!
//! The bridge and its netgraph NAT node are shared by every machine on the
//! host and are created once. Tap devices are per machine. Which interfaces
//! exist is always read back from the host, never remembered.
//!
//! Bridge setup has no rollback: if a step fails halfway, the partially
//! configured bridge stays and the next `ensure_bridge` sees it as present.

use crate::host::{Host, HostInterface};
use bhyvm_core::{Error, NetworkConfig, Result, args};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, info};

const TAP_PREFIX: &str = "tap";
const TAP_ALLOCATION_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSetup {
    /// The bridge was already present and was left untouched.
    Existing,
    /// The bridge was created and NAT attached to `uplink`.
    Created { uplink: String, alias: Ipv4Addr },
}

#[derive(Debug, Clone)]
pub struct NetworkProvisioner {
    host: Host,
}

impl NetworkProvisioner {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    /// Creates the bridge and its NAT node unless the bridge already exists.
    pub async fn ensure_bridge(&self, network: &NetworkConfig) -> Result<BridgeSetup> {
        let interfaces = self.host.interfaces.interfaces()?;
        if interfaces.iter().any(|iface| iface.name == network.bridge) {
            debug!("bridge {} already exists", network.bridge);
            return Ok(BridgeSetup::Existing);
        }

        let ifconfig = self.host.tools.ifconfig.as_str();
        let bridge = network.bridge.as_str();
        info!("creating bridge {bridge} with address {}", network.subnet);
        self.host.run_privileged(ifconfig, args![bridge, "create"]).await?;
        self.host
            .run_privileged(ifconfig, args![bridge, network.subnet])
            .await?;
        self.host.run_privileged(ifconfig, args![bridge, "up"]).await?;

        let (uplink, alias) = select_uplink(&interfaces, &network.subnet).ok_or_else(|| {
            Error::NotFound(format!(
                "no interface with an IPv4 address outside 127.0.0.0/8 and {}",
                network.subnet.trunc()
            ))
        })?;
        self.attach_nat(&uplink, alias).await?;

        Ok(BridgeSetup::Created { uplink, alias })
    }

    async fn attach_nat(&self, uplink: &str, alias: Ipv4Addr) -> Result<()> {
        info!("attaching NAT to {uplink} with alias address {alias}");
        let ngctl = self.host.tools.ngctl.as_str();
        let node = format!("{uplink}_NAT");
        let steps = [
            args!["mkpeer", format!("{uplink}:"), "nat", "lower", "in"],
            args!["name", format!("{uplink}:lower"), node],
            args!["connect", format!("{uplink}:"), format!("{node}:"), "upper", "out"],
            args!["msg", format!("{node}:"), "setdlt", "1"],
            args!["msg", format!("{node}:"), "setaliasaddr", alias],
        ];
        for step in steps {
            self.host.run_privileged(ngctl, step).await?;
        }
        Ok(())
    }

    /// Creates the next free tap device and adds it to `bridge`.
    ///
    /// Another process may create the same name between the scan and the
    /// create; that case is detected and the scan repeated.
    pub async fn allocate_tap(&self, bridge: &str) -> Result<String> {
        let ifconfig = self.host.tools.ifconfig.as_str();
        let mut attempt = 0;
        let tap = loop {
            attempt += 1;
            let tap = next_tap_name(&self.host.interfaces.interfaces()?);
            match self.host.run_privileged(ifconfig, args![tap, "create"]).await {
                Ok(_) => break tap,
                Err(e) if attempt < TAP_ALLOCATION_ATTEMPTS && self.host.interfaces.contains(&tap)? => {
                    debug!("{tap} was taken concurrently ({e}), rescanning");
                }
                Err(e) => return Err(e),
            }
        };

        self.host
            .run_privileged(ifconfig, args![bridge, "addm", tap])
            .await?;
        self.host.run_privileged(ifconfig, args![tap, "up"]).await?;
        info!("allocated {tap} on {bridge}");
        Ok(tap)
    }

    pub async fn release_tap(&self, tap: &str) -> Result<()> {
        self.host
            .run_privileged(&self.host.tools.ifconfig, args![tap, "destroy"])
            .await?;
        info!("released {tap}");
        Ok(())
    }
}

/// First interface with an IPv4 address that is neither loopback nor inside
/// the bridge subnet, with that address.
pub fn select_uplink(interfaces: &[HostInterface], subnet: &Ipv4Net) -> Option<(String, Ipv4Addr)> {
    interfaces.iter().find_map(|iface| {
        iface
            .ipv4
            .iter()
            .find(|addr| !addr.is_loopback() && !subnet.contains(*addr))
            .map(|addr| (iface.name.clone(), *addr))
    })
}

/// `tap<max+1>` over existing `tap<N>` interfaces, or `tap0`. Gaps are not
/// reused.
pub fn next_tap_name(interfaces: &[HostInterface]) -> String {
    let next = interfaces
        .iter()
        .filter_map(|iface| tap_index(&iface.name))
        .max()
        .map_or(0, |max| max + 1);
    format!("{TAP_PREFIX}{next}")
}

fn tap_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(TAP_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
