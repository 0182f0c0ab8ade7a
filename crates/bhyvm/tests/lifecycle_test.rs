//! Machine lifecycle end to end against the scripted host.

use bhyvm::test_utils::{FakeHost, fast_settings};
use bhyvm::{DriverSettings, Machine, MachineState, StoreLayout};
use bhyvm_core::{Error, MachineOptions, StartFailurePolicy, VmIdentity};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const VM: &str = "docker-machine-alice-dev";

struct Fixture {
    _dir: TempDir,
    store: PathBuf,
    fake: Arc<FakeHost>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let fake = FakeHost::new(dir.path().join("host"));

        let iso = StoreLayout::new(&store).cached_boot_image();
        std::fs::create_dir_all(iso.parent().unwrap()).unwrap();
        std::fs::write(&iso, b"boot2docker iso").unwrap();

        Self {
            _dir: dir,
            store,
            fake,
        }
    }

    fn machine(&self, name: &str) -> Machine {
        self.machine_with(name, fast_settings())
    }

    fn machine_with(&self, name: &str, settings: DriverSettings) -> Machine {
        Machine::new(
            VmIdentity::new("alice", name),
            StoreLayout::new(&self.store),
            self.fake.host(),
            settings,
        )
        .unwrap()
    }
}

mod create {
    use super::*;

    #[tokio::test]
    async fn brings_machine_up() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");

        let config = machine.create(MachineOptions::default()).await.unwrap();

        assert_eq!(machine.state().await.unwrap(), MachineState::Running);
        let ip = machine.ip().await.unwrap();
        assert!(config.network.dhcp_range.contains(ip));
        assert_eq!(machine.url().await.unwrap(), format!("tcp://{ip}:2376"));
        assert_eq!(fx.fake.probes(), vec![SocketAddr::from((ip, 22))]);

        let layout = machine.layout();
        for file in [
            layout.disk(),
            layout.config(),
            layout.device_map(),
            layout.boot_image(),
            layout.console_pid(),
            layout.tap_record(),
            layout.ssh_key(),
        ] {
            assert!(file.exists(), "{} missing", file.display());
        }
        assert_eq!(
            std::fs::metadata(layout.disk()).unwrap().len(),
            config.disk_size_bytes
        );
        assert!(fx.store.join("dnsmasq.conf").exists());
    }

    #[tokio::test]
    async fn launches_bhyve_with_machine_resources() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        let config = machine.create(MachineOptions::default()).await.unwrap();

        let daemon = fx.fake.calls_to("daemon");
        let bhyve = daemon
            .iter()
            .find(|call| call[1] == "-t")
            .expect("bhyve was not launched");
        assert_eq!(&bhyve[..6], &["daemon", "-t", VM, "-f", "sudo", "bhyve"]);
        assert!(bhyve.contains(&format!("2:0,virtio-net,tap0,mac={}", config.mac)));
        assert_eq!(bhyve.last().unwrap(), VM);

        let grub = fx.fake.calls_to("grub-bhyve");
        assert_eq!(grub.len(), 1);
        assert_eq!(grub[0][grub[0].len() - 3..], ["-M", "1024M", VM]);
    }

    #[tokio::test]
    async fn skips_busy_console_devices() {
        let fx = Fixture::new();
        fx.fake.set_console_busy(0);
        fx.fake.set_console_busy(1);
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();

        let fuser = fx.fake.calls_to("fuser");
        assert_eq!(fuser.len(), 3);
        let expected = format!("com1,{}", fx.fake.host().paths.dev_dir.join("nmdm2A").display());
        let daemon = fx.fake.calls_to("daemon");
        assert!(daemon.iter().any(|call| call.contains(&expected)));
        assert!(daemon.iter().any(|call| {
            call.iter()
                .any(|arg| arg.ends_with("nmdm2B"))
                && call.contains(&"console-log".to_string())
        }));
    }

    #[tokio::test]
    async fn console_probe_attempts_bound_the_devices_searched() {
        let fx = Fixture::new();
        fx.fake.set_console_busy(0);
        fx.fake.set_console_busy(1);
        fx.fake.set_console_busy(2);
        let mut settings = fast_settings();
        settings.retry.console_probe.attempts = 3;
        let machine = fx.machine_with("dev", settings);

        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceBusy(ref msg) if msg.contains("first 3")));
        assert_eq!(fx.fake.calls_to("fuser").len(), 3);
    }

    #[tokio::test]
    async fn shared_infrastructure_is_provisioned_once() {
        let fx = Fixture::new();
        let dev = fx.machine("dev");
        let ci = fx.machine("ci");

        dev.create(MachineOptions::default()).await.unwrap();
        ci.create(MachineOptions::default()).await.unwrap();

        let bridge_creates = fx
            .fake
            .calls_to("ifconfig")
            .into_iter()
            .filter(|call| call[1..] == ["bridge0", "create"])
            .count();
        assert_eq!(bridge_creates, 1);
        assert_eq!(fx.fake.calls_to("dnsmasq").len(), 1);
        assert_eq!(fx.fake.calls_to("ngctl").len(), 5);

        let dev_tap = std::fs::read_to_string(dev.layout().tap_record()).unwrap();
        let ci_tap = std::fs::read_to_string(ci.layout().tap_record()).unwrap();
        assert_eq!(dev_tap.trim(), "tap0");
        assert_eq!(ci_tap.trim(), "tap1");
        assert_ne!(dev.ip().await.unwrap(), ci.ip().await.unwrap());
    }

    #[tokio::test]
    async fn macs_differ_between_machines() {
        let fx = Fixture::new();
        let a = fx.machine("a").create(MachineOptions::default()).await.unwrap();
        let b = fx.machine("b").create(MachineOptions::default()).await.unwrap();
        assert!(a.mac.has_driver_prefix());
        assert_ne!(a.mac, b.mac);
    }

    #[tokio::test]
    async fn recreate_keeps_snapshotted_config() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        let first = machine.create(MachineOptions::default()).await.unwrap();
        machine.kill().await.unwrap();

        let second = machine
            .create(MachineOptions {
                memory_mb: 4096,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(fx.fake.calls_to("ssh-keygen").len(), 1);
    }

    #[tokio::test]
    async fn rejects_remote_boot_image() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        let err = machine
            .create(MachineOptions {
                boot_image_url: Some("https://example.com/boot2docker.iso".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(fx.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_options_before_touching_host() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        let err = machine
            .create(MachineOptions {
                dhcp_range: "10.0.0.10,10.0.0.20".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(fx.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn refuses_running_machine() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        fx.fake.start_vm(VM);
        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
    }
}

mod start {
    use super::*;

    #[tokio::test]
    async fn requires_created_machine() {
        let fx = Fixture::new();
        let err = fx.machine("dev").start().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn refuses_when_running() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        assert!(matches!(machine.start().await, Err(Error::AlreadyRunning)));
    }

    #[tokio::test]
    async fn retries_boot_loader() {
        let fx = Fixture::new();
        fx.fake.fail_grub(3);
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        assert_eq!(fx.fake.calls_to("grub-bhyve").len(), 4);
        assert_eq!(machine.state().await.unwrap(), MachineState::Running);
    }

    #[tokio::test]
    async fn boot_loader_exhaustion_is_reported() {
        let fx = Fixture::new();
        fx.fake.fail_grub(u32::MAX);
        let machine = fx.machine("dev");
        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(
            matches!(err, Error::BootLoaderExhausted { ref vm, attempts: 16 } if vm == VM),
            "{err:?}"
        );
        assert!(err.is_retryable());
        assert!(fx.fake.calls_to("daemon").is_empty());
    }

    #[tokio::test]
    async fn failed_start_tears_down() {
        let fx = Fixture::new();
        fx.fake.set_lease_on_boot(false);
        let machine = fx.machine("dev");

        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");

        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
        assert!(!fx.fake.interface_names().contains(&"tap0".to_string()));
        assert!(!machine.layout().tap_record().exists());
        assert!(!machine.layout().console_pid().exists());
    }

    #[tokio::test]
    async fn leave_running_keeps_resources() {
        let fx = Fixture::new();
        fx.fake.set_lease_on_boot(false);
        let settings = DriverSettings {
            start_failure: StartFailurePolicy::LeaveRunning,
            ..fast_settings()
        };
        let machine = fx.machine_with("dev", settings);

        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        assert_eq!(machine.state().await.unwrap(), MachineState::Running);
        assert!(fx.fake.interface_names().contains(&"tap0".to_string()));
        assert!(machine.layout().tap_record().exists());
    }

    #[tokio::test]
    async fn unreachable_ssh_times_out() {
        let fx = Fixture::new();
        fx.fake.set_reachable(false);
        let machine = fx.machine("dev");

        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(ref msg) if msg.contains("SSH")));
        assert_eq!(fx.fake.probes().len(), 5);
    }

    #[tokio::test]
    async fn reclaims_resources_of_vanished_vm() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        // The VM goes away behind the driver's back.
        std::fs::remove_file(fx.fake.vmm_dir().join(VM)).unwrap();
        fx.fake.clear_calls();

        machine.start().await.unwrap();

        let taps: Vec<String> = fx
            .fake
            .interface_names()
            .into_iter()
            .filter(|name| name.starts_with("tap"))
            .collect();
        assert_eq!(taps, vec!["tap0"]);
        let ifconfig = fx.fake.calls_to("ifconfig");
        assert_eq!(ifconfig[0], vec!["ifconfig", "tap0", "destroy"]);
        assert_eq!(
            std::fs::read_to_string(machine.layout().tap_record()).unwrap(),
            "tap0\n"
        );

        machine.kill().await.unwrap();
        assert!(!fx.fake.interface_names().iter().any(|n| n.starts_with("tap")));
    }

    #[tokio::test]
    async fn kills_orphaned_console_logger() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        std::fs::remove_file(fx.fake.vmm_dir().join(VM)).unwrap();
        let mut logger = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        std::fs::write(
            machine.layout().console_pid(),
            format!("{}\n", logger.id().unwrap()),
        )
        .unwrap();

        machine.start().await.unwrap();

        assert!(!logger.wait().await.unwrap().success());
        assert_eq!(machine.state().await.unwrap(), MachineState::Running);
    }

    #[tokio::test]
    async fn no_free_console_is_resource_busy() {
        let fx = Fixture::new();
        fx.fake.set_all_consoles_busy();
        let machine = fx.machine("dev");

        let err = machine.create(MachineOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceBusy(_)));
        assert_eq!(fx.fake.calls_to("fuser").len(), 100);
        // grub-bhyve had already created the VM; teardown destroyed it.
        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
    }
}

mod kill {
    use super::*;

    #[tokio::test]
    async fn reclaims_everything() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();

        machine.kill().await.unwrap();

        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
        assert!(!fx.fake.vm_exists(VM));
        assert!(!fx.fake.interface_names().iter().any(|n| n.starts_with("tap")));
        assert!(!machine.layout().tap_record().exists());
        assert!(!machine.layout().console_pid().exists());
        assert!(matches!(machine.ip().await, Err(Error::NotRunning)));
        // Shared infrastructure stays.
        assert!(fx.fake.interface_names().contains(&"bridge0".to_string()));
    }

    #[tokio::test]
    async fn is_idempotent() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();

        machine.kill().await.unwrap();
        fx.fake.clear_calls();
        machine.kill().await.unwrap();

        assert!(fx.fake.calls().is_empty());
        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
    }

    #[tokio::test]
    async fn absent_machine_is_a_no_op() {
        let fx = Fixture::new();
        fx.machine("never").kill().await.unwrap();
        assert!(fx.fake.calls().is_empty());
    }

    #[tokio::test]
    async fn destroy_exhaustion_still_releases_resources() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        fx.fake.set_sticky_vm(true);

        let err = machine.kill().await.unwrap_err();
        assert!(matches!(err, Error::DestroyExhausted { attempts: 16, .. }));
        assert_eq!(fx.fake.calls_to("bhyvectl").len(), 16);
        assert!(!machine.layout().tap_record().exists());
        assert!(!machine.layout().console_pid().exists());
    }

    #[tokio::test]
    async fn tap_release_failure_does_not_stop_teardown() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        fx.fake.set_fail_tap_destroy(true);

        machine.kill().await.unwrap();

        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
        assert!(!machine.layout().console_pid().exists());
        // The record stays so a later kill can retry the release.
        assert!(machine.layout().tap_record().exists());

        fx.fake.set_fail_tap_destroy(false);
        machine.kill().await.unwrap();
        assert!(!machine.layout().tap_record().exists());
    }

    #[tokio::test]
    async fn stop_is_kill() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        machine.stop().await.unwrap();
        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
        assert_eq!(fx.fake.calls_to("bhyvectl").len(), 1);
    }
}

mod restart {
    use super::*;

    #[tokio::test]
    async fn stops_then_starts() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        let ip = machine.ip().await.unwrap();

        machine.restart().await.unwrap();

        assert_eq!(machine.state().await.unwrap(), MachineState::Running);
        assert_eq!(fx.fake.calls_to("bhyvectl").len(), 1);
        assert_eq!(fx.fake.calls_to("grub-bhyve").len(), 2);
        assert_eq!(machine.ip().await.unwrap(), ip);
        let taps: Vec<_> = fx
            .fake
            .interface_names()
            .into_iter()
            .filter(|n| n.starts_with("tap"))
            .collect();
        assert_eq!(taps, vec!["tap0"]);
    }

    #[tokio::test]
    async fn starts_stopped_machine() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        machine.stop().await.unwrap();
        fx.fake.clear_calls();

        machine.restart().await.unwrap();
        assert!(fx.fake.calls_to("bhyvectl").is_empty());
        assert_eq!(machine.state().await.unwrap(), MachineState::Running);
    }
}

mod remove {
    use super::*;

    #[tokio::test]
    async fn kills_and_deletes_disk() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();

        machine.remove().await.unwrap();

        assert_eq!(machine.state().await.unwrap(), MachineState::Stopped);
        assert!(!machine.layout().disk().exists());
    }

    #[tokio::test]
    async fn kill_failure_does_not_block_removal() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        fx.fake.set_sticky_vm(true);

        machine.remove().await.unwrap();
        assert!(!machine.layout().disk().exists());
    }

    #[tokio::test]
    async fn never_created_machine() {
        let fx = Fixture::new();
        fx.machine("ghost").remove().await.unwrap();
    }
}

mod ip {
    use super::*;

    #[tokio::test]
    async fn reads_lease_when_not_cached() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        let ip = machine.ip().await.unwrap();

        // A second handle for the same machine has no cache.
        let other = fx.machine("dev");
        assert_eq!(other.ip().await.unwrap(), ip);
        assert_eq!(ip, Ipv4Addr::new(192, 168, 8, 10));
    }

    #[tokio::test]
    async fn running_without_lease_is_not_found() {
        let fx = Fixture::new();
        let machine = fx.machine("dev");
        machine.create(MachineOptions::default()).await.unwrap();
        std::fs::remove_file(fx.store.join("bhyve.leases")).unwrap();

        let other = fx.machine("dev");
        assert!(matches!(other.ip().await, Err(Error::NotFound(_))));
    }
}
