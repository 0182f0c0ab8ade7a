mod config;
mod console;

use anyhow::Context;
use bhyvm::{CONSOLE_LOG_COMMAND, DriverSettings, Host, Machine};
use bhyvm_core::MachineOptions;
use clap::{Parser, Subcommand};
use config::FileConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const MAX_CPUS: u32 = 256;
const MAX_MEMORY_MB: u32 = 1024 * 1024; // 1 TB
const MAX_DISK_SIZE_MB: u64 = u64::MAX / (1024 * 1024);

fn parse_cpus(s: &str) -> Result<u32, String> {
    let cpus: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if cpus == 0 {
        return Err("cpus must be at least 1".to_string());
    }
    if cpus > MAX_CPUS {
        return Err(format!("cpus cannot exceed {MAX_CPUS}"));
    }
    Ok(cpus)
}

fn parse_memory(s: &str) -> Result<u32, String> {
    let memory: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if memory == 0 {
        return Err("memory must be at least 1 MB".to_string());
    }
    if memory > MAX_MEMORY_MB {
        return Err(format!("memory cannot exceed {MAX_MEMORY_MB} MB"));
    }
    Ok(memory)
}

fn parse_disk_size(s: &str) -> Result<u64, String> {
    let size: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if size == 0 {
        return Err("disk size must be at least 1 MB".to_string());
    }
    if size > MAX_DISK_SIZE_MB {
        return Err(format!("disk size cannot exceed {MAX_DISK_SIZE_MB} MB"));
    }
    Ok(size)
}

#[derive(Parser)]
#[command(name = "bhyvm")]
#[command(about = "Runs boot2docker machines on FreeBSD bhyve")]
#[command(version)]
struct Cli {
    /// Directory holding machines and shared network state [default: ~/.bhyvm]
    #[arg(long, global = true, env = "BHYVM_STORE")]
    store: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, short, global = true, env = "BHYVM_CONFIG")]
    config: Option<PathBuf>,

    /// Log every command the driver runs
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Machine options settable from flags, overlaid on the config file.
#[derive(clap::Args, Debug, Default)]
struct CreateArgs {
    /// Size of the disk image in MB
    #[arg(long = "bhyve-disk-size", env = "BHYVE_DISK_SIZE", value_parser = parse_disk_size)]
    disk_size: Option<u64>,

    /// Memory in MB (1-1048576)
    #[arg(long = "bhyve-memory", env = "BHYVE_MEMORY", value_parser = parse_memory)]
    memory: Option<u32>,

    /// Number of CPUs (1-256)
    #[arg(long = "bhyve-cpus", env = "BHYVE_CPUS", value_parser = parse_cpus)]
    cpus: Option<u32>,

    /// Bridge the machine's tap device joins
    #[arg(long = "bhyve-bridge", env = "BHYVE_BRIDGE")]
    bridge: Option<String>,

    /// Bridge address with prefix, e.g. 192.168.8.1/24
    #[arg(long = "bhyve-subnet", env = "BHYVE_SUBNET")]
    subnet: Option<String>,

    /// Addresses handed out by DHCP, as start,end
    #[arg(long = "bhyve-dhcp-range", env = "BHYVE_DHCP_RANGE")]
    dhcp_range: Option<String>,

    /// Boot ISO as a local path or file:// URL
    #[arg(long = "bhyve-boot2docker-url", env = "BHYVE_BOOT2DOCKER_URL")]
    boot2docker_url: Option<String>,
}

impl CreateArgs {
    fn apply(self, options: &mut MachineOptions) {
        if let Some(disk_size) = self.disk_size {
            options.disk_size_mb = disk_size;
        }
        if let Some(memory) = self.memory {
            options.memory_mb = memory;
        }
        if let Some(cpus) = self.cpus {
            options.cpus = cpus;
        }
        if let Some(bridge) = self.bridge {
            options.bridge = bridge;
        }
        if let Some(subnet) = self.subnet {
            options.subnet = subnet;
        }
        if let Some(dhcp_range) = self.dhcp_range {
            options.dhcp_range = dhcp_range;
        }
        if let Some(url) = self.boot2docker_url {
            options.boot_image_url = Some(url);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a machine and start it
    Create {
        name: String,
        #[command(flatten)]
        args: CreateArgs,
    },

    /// Start a stopped machine
    Start { name: String },

    /// Stop a machine
    Stop { name: String },

    /// Destroy a machine's VM and release its resources
    Kill { name: String },

    /// Stop a machine if running, then start it
    Restart { name: String },

    /// Kill a machine and delete its disk
    #[command(alias = "remove")]
    Rm { name: String },

    /// Print Running or Stopped
    Status { name: String },

    /// Print a running machine's address
    Ip { name: String },

    /// Print a running machine's Docker URL
    Url { name: String },

    /// Copy a serial device into a log file (run by the driver itself)
    #[command(name = CONSOLE_LOG_COMMAND, hide = true)]
    ConsoleLog { device: PathBuf, log_file: PathBuf },

    /// Show version information
    Version,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let store = cli.store;
    let open = |name: &str| -> anyhow::Result<Machine> {
        let store = match store.or(file.store) {
            Some(store) => store,
            None => config::default_store()?,
        };
        let settings = DriverSettings {
            retry: file.retry,
            start_failure: file.start_failure,
            console_worker: std::env::current_exe().context("cannot locate the bhyvm binary")?,
            ..DriverSettings::default()
        };
        Ok(Machine::open(store, name, Host::system_with(file.tools), settings)?)
    };

    match cli.command {
        Commands::Create { name, args } => {
            let mut options = file.machine;
            args.apply(&mut options);
            let machine = open(&name)?;
            machine.create(options).await?;
            println!("{}", machine.url().await?);
        }
        Commands::Start { name } => open(&name)?.start().await?,
        Commands::Stop { name } => open(&name)?.stop().await?,
        Commands::Kill { name } => open(&name)?.kill().await?,
        Commands::Restart { name } => open(&name)?.restart().await?,
        Commands::Rm { name } => open(&name)?.remove().await?,
        Commands::Status { name } => println!("{}", open(&name)?.state().await?),
        Commands::Ip { name } => println!("{}", open(&name)?.ip().await?),
        Commands::Url { name } => println!("{}", open(&name)?.url().await?),
        Commands::ConsoleLog { device, log_file } => {
            tokio::task::spawn_blocking(move || console::log_serial(&device, &log_file)).await??;
        }
        Commands::Version => println!("bhyvm {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parsers {
        use super::*;

        #[test]
        fn cpus_bounds() {
            assert_eq!(parse_cpus("4"), Ok(4));
            assert!(parse_cpus("0").is_err());
            assert!(parse_cpus("257").is_err());
            assert!(parse_cpus("four").is_err());
        }

        #[test]
        fn memory_bounds() {
            assert_eq!(parse_memory("1024"), Ok(1024));
            assert!(parse_memory("0").is_err());
            assert!(parse_memory("2097152").is_err());
        }

        #[test]
        fn disk_size_bounds() {
            assert_eq!(parse_disk_size("16384"), Ok(16384));
            assert!(parse_disk_size("0").is_err());
            assert_eq!(parse_disk_size(&MAX_DISK_SIZE_MB.to_string()), Ok(MAX_DISK_SIZE_MB));
            assert!(parse_disk_size(&(MAX_DISK_SIZE_MB + 1).to_string()).is_err());
        }
    }

    mod cli {
        use super::*;

        #[test]
        fn create_flags_overlay_options() {
            let cli = Cli::try_parse_from([
                "bhyvm",
                "create",
                "dev",
                "--bhyve-cpus",
                "2",
                "--bhyve-bridge",
                "bridge1",
            ])
            .unwrap();
            let Commands::Create { name, args } = cli.command else {
                panic!("expected create");
            };
            assert_eq!(name, "dev");

            let mut options = MachineOptions {
                memory_mb: 4096,
                ..Default::default()
            };
            args.apply(&mut options);
            assert_eq!(options.cpus, 2);
            assert_eq!(options.bridge, "bridge1");
            assert_eq!(options.memory_mb, 4096);
            assert!(options.boot_image_url.is_none());
        }

        #[test]
        fn global_flags_after_subcommand() {
            let cli =
                Cli::try_parse_from(["bhyvm", "status", "dev", "--store", "/tmp/s", "--debug"])
                    .unwrap();
            assert!(cli.debug);
            assert_eq!(cli.store, Some(PathBuf::from("/tmp/s")));
        }

        #[test]
        fn console_log_takes_device_and_file() {
            let cli = Cli::try_parse_from(["bhyvm", "console-log", "/dev/nmdm0B", "/m/console.log"])
                .unwrap();
            assert!(matches!(
                cli.command,
                Commands::ConsoleLog { ref device, .. } if device == &PathBuf::from("/dev/nmdm0B")
            ));
        }

        #[test]
        fn rejects_zero_cpus() {
            assert!(Cli::try_parse_from(["bhyvm", "create", "dev", "--bhyve-cpus", "0"]).is_err());
        }

        #[test]
        fn definition_is_consistent() {
            use clap::CommandFactory;
            Cli::command().debug_assert();
        }
    }
}
