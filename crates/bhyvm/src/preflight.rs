//! Host checks run before a machine is created.

use crate::host::Host;
use bhyvm_core::{Error, HostTools, Result, args};
use tracing::{debug, info};

/// Kernel modules bhyve, the console pairs and netgraph NAT rely on.
pub const KERNEL_MODULES: &[&str] = &["vmm", "nmdm", "ng_ether"];

const IP_FORWARDING: &str = "net.inet.ip.forwarding";

/// Fails with `NotFound` naming the first tool that cannot be located.
pub fn check_required_commands(tools: &HostTools) -> Result<()> {
    for tool in tools.required() {
        match which::which(tool) {
            Ok(path) => debug!("{tool}: {}", path.display()),
            Err(_) => return Err(Error::NotFound(format!("{tool} is not installed"))),
        }
    }
    Ok(())
}

/// Fails with `NotFound` naming the first module `kldstat` does not report.
pub async fn check_kernel_modules(host: &Host) -> Result<()> {
    for module in KERNEL_MODULES {
        let output = host
            .runner
            .run(&host.tools.kldstat, &args!["-q", "-m", module])
            .await?;
        if !output.success() {
            return Err(Error::NotFound(format!("kernel module {module} is not loaded")));
        }
    }
    Ok(())
}

/// Turns on IPv4 forwarding if it is off. Returns whether it was changed.
pub async fn ensure_ip_forwarding(host: &Host) -> Result<bool> {
    let sysctl = host.tools.sysctl.as_str();
    let output = host.run(sysctl, args!["-n", IP_FORWARDING]).await?;
    let value = output.stdout_str();
    if value.trim() != "0" {
        debug!("{IP_FORWARDING} = {}", value.trim());
        return Ok(false);
    }

    info!("enabling {IP_FORWARDING}");
    host.run_privileged(sysctl, args![format!("{IP_FORWARDING}=1")])
        .await?;
    Ok(true)
}

/// All host checks, cheapest first.
pub async fn run(host: &Host) -> Result<()> {
    check_required_commands(&host.tools)?;
    check_kernel_modules(host).await?;
    ensure_ip_forwarding(host).await?;
    Ok(())
}
