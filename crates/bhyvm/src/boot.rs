//! grub-bhyve handoff.
//!
//! bhyve has no firmware in this setup, so grub-bhyve loads the kernel and
//! initrd from the ISO into the VM's memory before bhyve itself starts. It
//! is scripted over stdin and is known to fail spuriously right after a
//! previous instance of the VM was destroyed, hence the retries.

use crate::host::Host;
use bhyvm_core::{Error, Result, RetryPolicy, args, strip_control};
use std::path::Path;
use tracing::{debug, info};

const GRUB_BANNER: &str = "GNU GRUB";

const GRUB_SCRIPT: &str = "linux (cd0)/boot/vmlinuz waitusb=5:LABEL=boot2docker-data base norestore noembed\n\
                           initrd (cd0)/boot/initrd.img\n\
                           boot\n";

/// Writes the grub device map pointing `hd0` at the disk and `cd0` at the ISO.
pub async fn write_device_map(path: &Path, disk: &Path, iso: &Path) -> Result<()> {
    let map = format!("(hd0) {}\n(cd0) {}\n", disk.display(), iso.display());
    tokio::fs::write(path, map).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BootLoader {
    host: Host,
}

impl BootLoader {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    /// Loads the guest kernel, retrying until grub prints its banner.
    pub async fn boot(
        &self,
        device_map: &Path,
        memory_mb: u32,
        vm_name: &str,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let program = self.host.tools.grub_bhyve.as_str();
        let (wrapped, args) = self.host.tools.privileged(
            program,
            args![
                "-m",
                device_map.display(),
                "-r",
                "cd0",
                "-M",
                format!("{memory_mb}M"),
                vm_name,
            ],
        );

        let booted = policy
            .poll(|attempt| {
                let wrapped = wrapped.as_str();
                let args = args.as_slice();
                async move {
                    let output = self
                        .host
                        .runner
                        .run_with_input(wrapped, args, GRUB_SCRIPT)
                        .await?;
                    let combined = output.combined();
                    if combined.contains(GRUB_BANNER) {
                        Ok(Some(()))
                    } else {
                        debug!(
                            "grub-bhyve attempt {attempt} for {vm_name}: {}",
                            strip_control(&combined)
                        );
                        Ok(None)
                    }
                }
            })
            .await?;

        match booted {
            Some(()) => {
                info!("boot loader handed off {vm_name}");
                Ok(())
            }
            None => Err(Error::BootLoaderExhausted {
                vm: vm_name.to_string(),
                attempts: policy.attempts,
            }),
        }
    }
}
