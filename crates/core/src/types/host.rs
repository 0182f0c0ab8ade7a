use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Locations of the host programs the driver shells out to.
///
/// Tools that mutate host state run through `sudo` when `use_sudo` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostTools {
    pub use_sudo: bool,
    pub sudo: String,
    pub ifconfig: String,
    pub ngctl: String,
    pub sysctl: String,
    pub kldstat: String,
    pub dnsmasq: String,
    pub daemon: String,
    pub fuser: String,
    pub bhyve: String,
    pub bhyvectl: String,
    pub grub_bhyve: String,
    pub ssh_keygen: String,
}

impl Default for HostTools {
    fn default() -> Self {
        Self {
            use_sudo: true,
            sudo: "sudo".to_string(),
            ifconfig: "ifconfig".to_string(),
            ngctl: "ngctl".to_string(),
            sysctl: "sysctl".to_string(),
            kldstat: "kldstat".to_string(),
            dnsmasq: "dnsmasq".to_string(),
            daemon: "/usr/sbin/daemon".to_string(),
            fuser: "fuser".to_string(),
            bhyve: "bhyve".to_string(),
            bhyvectl: "bhyvectl".to_string(),
            grub_bhyve: "/usr/local/sbin/grub-bhyve".to_string(),
            ssh_keygen: "ssh-keygen".to_string(),
        }
    }
}

impl HostTools {
    /// Program and argument vector for running `program` with privileges.
    pub fn privileged(&self, program: &str, args: Vec<String>) -> (String, Vec<String>) {
        if self.use_sudo {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(program.to_string());
            full.extend(args);
            (self.sudo.clone(), full)
        } else {
            (program.to_string(), args)
        }
    }

    /// Programs that must be on `PATH` before a machine can be created.
    pub fn required(&self) -> Vec<&str> {
        let mut tools = vec![
            self.ifconfig.as_str(),
            self.ngctl.as_str(),
            self.dnsmasq.as_str(),
            self.daemon.as_str(),
            self.fuser.as_str(),
            self.bhyve.as_str(),
            self.bhyvectl.as_str(),
            self.grub_bhyve.as_str(),
            self.ssh_keygen.as_str(),
        ];
        if self.use_sudo {
            tools.insert(0, self.sudo.as_str());
        }
        tools
    }
}

/// Host filesystem locations the driver inspects instead of keeping state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    /// A VM is running iff `<vmm_dir>/<vm-name>` exists.
    pub vmm_dir: PathBuf,
    /// Directory holding `nmdm<N>A` / `nmdm<N>B` device pairs.
    pub dev_dir: PathBuf,
    pub random_device: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            vmm_dir: PathBuf::from("/dev/vmm"),
            dev_dir: PathBuf::from("/dev"),
            random_device: PathBuf::from("/dev/random"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_prefixes_sudo() {
        let tools = HostTools::default();
        let (program, args) = tools.privileged("ifconfig", vec!["bridge0".into(), "create".into()]);
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["ifconfig", "bridge0", "create"]);
    }

    #[test]
    fn privileged_without_sudo_runs_directly() {
        let tools = HostTools {
            use_sudo: false,
            ..HostTools::default()
        };
        let (program, args) = tools.privileged("ifconfig", vec!["bridge0".into()]);
        assert_eq!(program, "ifconfig");
        assert_eq!(args, vec!["bridge0"]);
    }

    #[test]
    fn required_includes_sudo_only_when_used() {
        let mut tools = HostTools::default();
        assert_eq!(tools.required()[0], "sudo");
        tools.use_sudo = false;
        assert!(!tools.required().contains(&"sudo"));
    }
}
