//! Guest disk, SSH key and boot ISO preparation.
//!
//! The disk starts out as a sparse raw file with a small tar archive at
//! offset zero. On first boot boot2docker finds the magic entry, formats the
//! disk and unpacks the archive into the docker user's home, which is how
//! the generated public key reaches the guest.

use crate::host::Host;
use crate::layout::StoreLayout;
use bhyvm_core::{Error, Result, args};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const FORMAT_MAGIC: &str = "boot2docker, please format-me";

/// Builds the tar archive boot2docker unpacks on first boot.
pub fn key_bundle(public_key: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    append_file(&mut builder, FORMAT_MAGIC, 0o644, FORMAT_MAGIC.as_bytes())?;

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o700);
    dir.set_size(0);
    builder.append_data(&mut dir, ".ssh/", std::io::empty())?;

    append_file(&mut builder, ".ssh/authorized_keys", 0o644, public_key)?;
    append_file(&mut builder, ".ssh/authorized_keys2", 0o644, public_key)?;

    Ok(builder.into_inner()?)
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    mode: u32,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Creates a sparse raw disk of `size_bytes` with `bundle` at offset zero.
/// An existing image is left alone; returns whether one was created.
pub async fn create_disk_image(path: &Path, size_bytes: u64, bundle: &[u8]) -> Result<bool> {
    if (bundle.len() as u64) > size_bytes {
        return Err(Error::InvalidConfig(format!(
            "disk size {size_bytes} bytes cannot hold the {} byte key bundle",
            bundle.len()
        )));
    }

    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!("disk image {} already exists", path.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    file.write_all(bundle).await?;
    file.set_len(size_bytes).await?;
    file.sync_all().await?;
    info!("created {} byte disk image {}", size_bytes, path.display());
    Ok(true)
}

/// Generates an RSA key pair at `key` unless the private key exists.
pub async fn ensure_ssh_key(host: &Host, key: &Path) -> Result<bool> {
    if tokio::fs::try_exists(key).await? {
        debug!("SSH key {} already exists", key.display());
        return Ok(false);
    }
    host.run(
        &host.tools.ssh_keygen,
        args!["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f", key.display()],
    )
    .await?;
    info!("generated SSH key {}", key.display());
    Ok(true)
}

/// Where to copy the boot ISO from.
///
/// No URL means the store's cached ISO. Only local paths and `file://` URLs
/// are accepted; fetching remote images is left to the caller.
pub fn resolve_boot_image(url: Option<&str>, store: &StoreLayout) -> Result<PathBuf> {
    let Some(url) = url else {
        return Ok(store.cached_boot_image());
    };
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if url.contains("://") {
        return Err(Error::Unsupported(format!(
            "boot image URL '{url}': only local paths and file:// URLs are accepted"
        )));
    }
    Ok(PathBuf::from(url))
}

/// Copies the boot ISO into the machine directory unless already there.
pub async fn copy_boot_image(source: &Path, dest: &Path) -> Result<bool> {
    if tokio::fs::try_exists(dest).await? {
        debug!("boot image {} already exists", dest.display());
        return Ok(false);
    }
    match tokio::fs::copy(source, dest).await {
        Ok(_) => {
            info!("copied boot image {} to {}", source.display(), dest.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(format!(
            "boot image {}",
            source.display()
        ))),
        Err(e) => Err(e.into()),
    }
}
