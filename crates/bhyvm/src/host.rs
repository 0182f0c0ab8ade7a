//! The host as the driver sees it: a command runner, the interface table,
//! and where its tools and device nodes live.

use crate::discovery::{ReadinessProbe, TcpProbe};
use bhyvm_core::{CommandOutput, CommandRunner, HostPaths, HostTools, Result, SystemRunner};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One network interface and its IPv4 addresses, in host order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub ipv4: Vec<Ipv4Addr>,
}

impl HostInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ipv4: Vec::new(),
        }
    }

    pub fn with_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.ipv4.push(addr);
        self
    }
}

/// Source of the host interface table. Re-read on every query; nothing is
/// cached between calls.
pub trait InterfaceTable: Send + Sync {
    fn interfaces(&self) -> Result<Vec<HostInterface>>;

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.interfaces()?.iter().any(|iface| iface.name == name))
    }
}

/// Reads interfaces with `getifaddrs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceTable for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;

        // getifaddrs yields one entry per address; fold them per interface
        // while keeping first-seen order.
        let mut interfaces: Vec<HostInterface> = Vec::new();
        for ifaddr in addrs {
            let v4 = ifaddr
                .address
                .as_ref()
                .and_then(|addr| addr.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip()));

            let idx = match interfaces.iter().position(|i| i.name == ifaddr.interface_name) {
                Some(idx) => idx,
                None => {
                    interfaces.push(HostInterface::new(ifaddr.interface_name.clone()));
                    interfaces.len() - 1
                }
            };
            if let Some(v4) = v4 {
                interfaces[idx].ipv4.push(v4);
            }
        }
        Ok(interfaces)
    }
}

/// Handles to everything outside the process. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub interfaces: Arc<dyn InterfaceTable>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub tools: HostTools,
    pub paths: HostPaths,
}

impl Host {
    /// The real host with default tool locations.
    pub fn system() -> Self {
        Self::system_with(HostTools::default())
    }

    pub fn system_with(tools: HostTools) -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            interfaces: Arc::new(SystemInterfaces),
            probe: Arc::new(TcpProbe::default()),
            tools,
            paths: HostPaths::default(),
        }
    }

    /// Runs `program` unprivileged and fails on a non-zero exit.
    pub async fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput> {
        self.runner.run(program, &args).await?.check(program)
    }

    /// Runs `program` through the privilege wrapper and fails on a non-zero
    /// exit.
    pub async fn run_privileged(&self, program: &str, args: Vec<String>) -> Result<CommandOutput> {
        self.run_privileged_unchecked(program, args)
            .await?
            .check(program)
    }

    /// Like [`Host::run_privileged`] but leaves the exit status to the caller.
    pub async fn run_privileged_unchecked(
        &self,
        program: &str,
        args: Vec<String>,
    ) -> Result<CommandOutput> {
        let (wrapped, args) = self.tools.privileged(program, args);
        self.runner.run(&wrapped, &args).await
    }

    /// Whether the VM's device node exists, i.e. the VM is running.
    pub async fn vm_exists(&self, vm_name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.paths.vmm_dir.join(vm_name)).await?)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("tools", &self.tools)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}
