//! Guest address discovery through the DHCP lease file, then an SSH
//! reachability wait.

use async_trait::async_trait;
use bhyvm_core::{Error, MacAddress, Result, RetryPolicy};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const SSH_PORT: u16 = 22;

/// Finds the address leased to `mac` in dnsmasq lease file contents.
///
/// A line matches when one of its fields equals the MAC, ignoring case; the
/// address is the field after it. This covers dnsmasq's own
/// `expiry mac ip host client-id` layout as well as `mac ip host`.
pub fn parse_lease(contents: &str, mac: &MacAddress) -> Option<Ipv4Addr> {
    let mac = mac.to_string();
    contents.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        fields.find(|field| field.eq_ignore_ascii_case(&mac))?;
        fields.next()?.parse().ok()
    })
}

/// Reads the lease file once. A missing file means no lease yet.
pub async fn read_lease(path: &Path, mac: &MacAddress) -> Result<Option<Ipv4Addr>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(parse_lease(&contents, mac)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Polls the lease file until `mac` has an address.
pub async fn wait_for_address(
    path: &Path,
    mac: &MacAddress,
    policy: &RetryPolicy,
) -> Result<Ipv4Addr> {
    debug!("waiting for a lease for {mac} in {}", path.display());
    let found = policy.poll(|_| read_lease(path, mac)).await?;
    match found {
        Some(addr) => {
            info!("{mac} leased {addr}");
            Ok(addr)
        }
        None => Err(Error::timeout_after(
            &format!("waiting for a DHCP lease for {mac}"),
            policy.total(),
        )),
    }
}

/// Checks whether a guest service accepts connections.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_reachable(&self, addr: SocketAddr) -> bool;
}

/// Plain TCP connect with a per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("connect to {addr}: {e}");
                false
            }
            Err(_) => {
                debug!("connect to {addr} timed out");
                false
            }
        }
    }
}

/// Polls `probe` until `addr` accepts connections.
pub async fn wait_for_ssh(
    probe: &dyn ReadinessProbe,
    addr: SocketAddr,
    policy: &RetryPolicy,
) -> Result<()> {
    debug!("waiting for SSH on {addr}");
    let ready = policy
        .poll(|_| async move { Ok(probe.is_reachable(addr).await.then_some(())) })
        .await?;
    ready.ok_or_else(|| {
        Error::timeout_after(&format!("waiting for SSH on {addr}"), policy.total())
    })
}
