//! The machine lifecycle.
//!
//! A [`Machine`] is a thin view over host state: whether the VM runs is read
//! from `/dev/vmm`, its tap and console logger from files in the machine
//! directory. Two processes holding a `Machine` for the same name see the
//! same VM.

use crate::boot::{self, BootLoader};
use crate::console::{ConsoleDevice, ConsoleLogger, PidFile};
use crate::dhcp::DhcpService;
use crate::discovery::{self, SSH_PORT};
use crate::disk;
use crate::host::Host;
use crate::layout::{MachineLayout, StoreLayout};
use crate::lock::ProvisionLock;
use crate::network::NetworkProvisioner;
use crate::preflight;
use bhyvm_core::{
    Error, MachineConfig, MachineOptions, NetworkConfig, Result, RetryPolicies,
    StartFailurePolicy, VmIdentity, args,
};
use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Port the Docker daemon in the guest listens on.
pub const DOCKER_PORT: u16 = 2376;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Stopped,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Running => f.write_str("Running"),
            MachineState::Stopped => f.write_str("Stopped"),
        }
    }
}

/// Knobs that are not part of a machine's configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub retry: RetryPolicies,
    pub start_failure: StartFailurePolicy,
    pub ssh_port: u16,
    /// Binary re-executed as the console logger.
    pub console_worker: PathBuf,
    /// Check tools, kernel modules and forwarding before create.
    pub preflight: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicies::default(),
            start_failure: StartFailurePolicy::default(),
            ssh_port: SSH_PORT,
            console_worker: PathBuf::from("bhyvm"),
            preflight: true,
        }
    }
}

/// Name of the user running the driver: the passwd entry for the real uid,
/// falling back to `$USER`.
pub fn current_operator() -> Result<String> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => return Ok(user.name),
        Ok(None) => debug!("no passwd entry for the current uid"),
        Err(e) => debug!("passwd lookup failed: {e}"),
    }
    std::env::var("USER")
        .map_err(|_| Error::NotFound("cannot determine the current user name".to_string()))
}

fn validate_machine_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid machine name '{name}'")))
    }
}

pub struct Machine {
    identity: VmIdentity,
    store: StoreLayout,
    layout: MachineLayout,
    host: Host,
    settings: DriverSettings,
    network: NetworkProvisioner,
    dhcp: DhcpService,
    console: ConsoleLogger,
    boot_loader: BootLoader,
    cached_ip: Mutex<Option<Ipv4Addr>>,
}

impl Machine {
    pub fn new(
        identity: VmIdentity,
        store: StoreLayout,
        host: Host,
        settings: DriverSettings,
    ) -> Result<Self> {
        validate_machine_name(identity.machine())?;
        let layout = store.machine(identity.machine());
        Ok(Self {
            network: NetworkProvisioner::new(host.clone()),
            dhcp: DhcpService::new(host.clone(), store.clone()),
            console: ConsoleLogger::new(host.clone(), settings.console_worker.clone()),
            boot_loader: BootLoader::new(host.clone()),
            identity,
            store,
            layout,
            host,
            settings,
            cached_ip: Mutex::new(None),
        })
    }

    /// Opens `name` in the store for the current operator.
    pub fn open(
        store_root: impl Into<PathBuf>,
        name: &str,
        host: Host,
        settings: DriverSettings,
    ) -> Result<Self> {
        let identity = VmIdentity::new(current_operator()?, name);
        Self::new(identity, StoreLayout::new(store_root), host, settings)
    }

    pub fn identity(&self) -> &VmIdentity {
        &self.identity
    }

    pub fn vm_name(&self) -> String {
        self.identity.vm_name()
    }

    pub fn layout(&self) -> &MachineLayout {
        &self.layout
    }

    pub async fn state(&self) -> Result<MachineState> {
        if self.host.vm_exists(&self.vm_name()).await? {
            Ok(MachineState::Running)
        } else {
            Ok(MachineState::Stopped)
        }
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.state().await? == MachineState::Running)
    }

    /// The configuration snapshotted at create time.
    pub async fn config(&self) -> Result<MachineConfig> {
        self.read_config().await?.ok_or_else(|| {
            Error::NotFound(format!("machine '{}' has not been created", self.identity.machine()))
        })
    }

    async fn read_config(&self) -> Result<Option<MachineConfig>> {
        match tokio::fs::read(self.layout.config()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_config(&self, config: &MachineConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(self.layout.config(), json).await?;
        Ok(())
    }

    /// Provisions host resources, the disk and the boot image, then starts
    /// the machine. Steps whose result already exists are skipped, so a
    /// failed create can be rerun.
    pub async fn create(&self, options: MachineOptions) -> Result<MachineConfig> {
        options.validate()?;
        let vm = self.vm_name();
        if self.is_running().await? {
            return Err(Error::AlreadyRunning);
        }

        if self.settings.preflight {
            preflight::run(&self.host).await?;
        }

        info!("creating {vm}");
        tokio::fs::create_dir_all(self.layout.dir()).await?;

        let source = disk::resolve_boot_image(options.boot_image_url.as_deref(), &self.store)?;
        let config = match self.read_config().await? {
            Some(config) => {
                debug!("reusing configuration of {vm}");
                config
            }
            None => {
                let config = options.into_config(self.layout.boot_image())?;
                self.write_config(&config).await?;
                config
            }
        };

        self.provision_shared(&config.network).await?;
        disk::copy_boot_image(&source, &config.boot_image).await?;

        disk::ensure_ssh_key(&self.host, &self.layout.ssh_key()).await?;
        let public_key = tokio::fs::read(self.layout.ssh_public_key()).await?;
        let bundle = disk::key_bundle(&public_key)?;
        disk::create_disk_image(&self.layout.disk(), config.disk_size_bytes, &bundle).await?;

        self.start().await?;
        Ok(config)
    }

    async fn provision_shared(&self, network: &NetworkConfig) -> Result<()> {
        let _lock = ProvisionLock::acquire(self.store.bridge_lock(&network.bridge)).await?;
        self.network.ensure_bridge(network).await?;
        self.dhcp.ensure_config(network).await?;
        self.dhcp.ensure_running(network).await?;
        Ok(())
    }

    /// Boots the machine and waits until it has an address and accepts SSH.
    ///
    /// On failure the [`StartFailurePolicy`] decides whether whatever was
    /// already allocated is torn down.
    pub async fn start(&self) -> Result<()> {
        let vm = self.vm_name();
        if self.is_running().await? {
            return Err(Error::AlreadyRunning);
        }
        let config = self.config().await?;
        self.reclaim_leftovers(&vm).await;

        info!("starting {vm}");
        match self.launch(&config).await {
            Ok(ip) => {
                info!("{vm} is up at {ip}");
                Ok(())
            }
            Err(e) => {
                match self.settings.start_failure {
                    StartFailurePolicy::Teardown => {
                        warn!("starting {vm} failed, tearing down: {e}");
                        if let Err(kill_err) = self.kill().await {
                            warn!("teardown of {vm} failed: {kill_err}");
                        }
                    }
                    StartFailurePolicy::LeaveRunning => {
                        warn!("starting {vm} failed, leaving its resources in place: {e}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Releases the tap and console logger of a previous run whose VM went
    /// away without a kill, so they are not orphaned by the new ones.
    async fn reclaim_leftovers(&self, vm: &str) {
        if let Err(e) = self.release_recorded_tap().await {
            warn!("failed to release the leftover tap device of {vm}: {e}");
        }
        let pid_file = PidFile::new(self.layout.console_pid());
        if let Err(e) = self.console.stop_logging(&pid_file).await {
            warn!("failed to stop the leftover console logger of {vm}: {e}");
        }
    }

    async fn launch(&self, config: &MachineConfig) -> Result<Ipv4Addr> {
        let vm = self.vm_name();
        let retry = &self.settings.retry;

        let device_map = self.layout.device_map();
        boot::write_device_map(&device_map, &self.layout.disk(), &config.boot_image).await?;
        self.boot_loader
            .boot(&device_map, config.memory_mb, &vm, &retry.boot_loader)
            .await?;

        let device = self.console.find_free_device(&retry.console_probe).await?;
        let pid_file = PidFile::new(self.layout.console_pid());
        self.console
            .start_logging(&device, &self.layout.console_log(), &pid_file)
            .await?;

        let tap = self.network.allocate_tap(&config.network.bridge).await?;
        tokio::fs::write(self.layout.tap_record(), format!("{tap}\n")).await?;

        self.spawn_hypervisor(config, &tap, &device).await?;
        self.wait_for_ip(config).await
    }

    async fn spawn_hypervisor(
        &self,
        config: &MachineConfig,
        tap: &str,
        device: &ConsoleDevice,
    ) -> Result<()> {
        let vm = self.vm_name();
        let bhyve_args = hypervisor_args(
            config,
            &vm,
            tap,
            &device.guest_end(),
            &self.layout.disk(),
            &self.host.paths.random_device,
        );
        let (program, bhyve_args) = self.host.tools.privileged(&self.host.tools.bhyve, bhyve_args);

        let mut daemon_args = args!["-t", vm, "-f", program];
        daemon_args.extend(bhyve_args);
        self.host.run(&self.host.tools.daemon, daemon_args).await?;
        Ok(())
    }

    async fn wait_for_ip(&self, config: &MachineConfig) -> Result<Ipv4Addr> {
        let retry = &self.settings.retry;
        let ip = discovery::wait_for_address(&self.store.leases(), &config.mac, &retry.lease).await?;
        discovery::wait_for_ssh(
            self.host.probe.as_ref(),
            SocketAddr::from((ip, self.settings.ssh_port)),
            &retry.ssh,
        )
        .await?;
        *self.cached_ip.lock().await = Some(ip);
        Ok(ip)
    }

    /// The guest has no clean shutdown path, so stopping is killing.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping {}", self.vm_name());
        self.kill().await
    }

    /// Destroys the VM and releases its tap and console logger. Safe to
    /// call on a machine that is not running.
    ///
    /// Every step runs even if an earlier one failed; the first hard failure
    /// is returned at the end.
    pub async fn kill(&self) -> Result<()> {
        let vm = self.vm_name();
        let destroyed = self.destroy_vm(&vm).await;

        if let Err(e) = self.release_recorded_tap().await {
            warn!("failed to release the tap device of {vm}: {e}");
        }

        let logger = self
            .console
            .stop_logging(&PidFile::new(self.layout.console_pid()))
            .await;

        *self.cached_ip.lock().await = None;

        destroyed?;
        logger
    }

    async fn destroy_vm(&self, vm: &str) -> Result<()> {
        if !self.host.vm_exists(vm).await? {
            debug!("{vm} is not running");
            return Ok(());
        }

        let policy = &self.settings.retry.destroy;
        let gone = policy
            .poll(|attempt| async move {
                if !self.host.vm_exists(vm).await? {
                    return Ok(Some(()));
                }
                let output = self
                    .host
                    .run_privileged_unchecked(
                        &self.host.tools.bhyvectl,
                        args!["--destroy", format!("--vm={vm}")],
                    )
                    .await?;
                if !output.success() {
                    debug!(
                        "bhyvectl --destroy attempt {attempt} for {vm}: {}",
                        output.combined().trim()
                    );
                }
                Ok(None)
            })
            .await?;

        if gone.is_none() && self.host.vm_exists(vm).await? {
            return Err(Error::DestroyExhausted {
                vm: vm.to_string(),
                attempts: policy.attempts,
            });
        }
        info!("destroyed {vm}");
        Ok(())
    }

    async fn release_recorded_tap(&self) -> Result<()> {
        let record = self.layout.tap_record();
        let tap = match tokio::fs::read_to_string(&record).await {
            Ok(contents) => contents.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if !tap.is_empty() {
            if self.host.interfaces.contains(&tap)? {
                self.network.release_tap(&tap).await?;
            } else {
                debug!("{tap} is already gone");
            }
        }
        remove_if_exists(&record).await
    }

    pub async fn restart(&self) -> Result<()> {
        if self.is_running().await? {
            self.stop().await?;
        }
        self.start().await
    }

    /// Kills the machine and deletes its disk image.
    pub async fn remove(&self) -> Result<()> {
        let vm = self.vm_name();
        if let Err(e) = self.kill().await {
            warn!("failed to kill {vm} before removal: {e}");
        }
        remove_if_exists(&self.layout.disk()).await?;
        info!("removed {vm}");
        Ok(())
    }

    /// Current address of a running machine.
    pub async fn ip(&self) -> Result<Ipv4Addr> {
        if !self.is_running().await? {
            return Err(Error::NotRunning);
        }
        let mut cached = self.cached_ip.lock().await;
        if let Some(ip) = *cached {
            return Ok(ip);
        }

        let config = self.config().await?;
        let ip = discovery::read_lease(&self.store.leases(), &config.mac)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no DHCP lease for {}", config.mac)))?;
        *cached = Some(ip);
        Ok(ip)
    }

    /// Docker endpoint of a running machine.
    pub async fn url(&self) -> Result<String> {
        Ok(format!("tcp://{}:{DOCKER_PORT}", self.ip().await?))
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("identity", &self.identity)
            .field("dir", &self.layout.dir())
            .finish_non_exhaustive()
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// bhyve argument vector for a machine.
pub fn hypervisor_args(
    config: &MachineConfig,
    vm: &str,
    tap: &str,
    console: &Path,
    disk: &Path,
    random_device: &Path,
) -> Vec<String> {
    args![
        "-A",
        "-H",
        "-P",
        "-s",
        "0:0,hostbridge",
        "-s",
        "1:0,lpc",
        "-s",
        format!("2:0,virtio-net,{tap},mac={}", config.mac),
        "-s",
        format!("3:0,virtio-blk,{}", disk.display()),
        "-s",
        format!("4:0,virtio-rnd,{}", random_device.display()),
        "-s",
        format!("5:0,ahci-cd,{}", config.boot_image.display()),
        "-l",
        format!("com1,{}", console.display()),
        "-c",
        config.cpus,
        "-m",
        format!("{}M", config.memory_mb),
        vm,
    ]
}
