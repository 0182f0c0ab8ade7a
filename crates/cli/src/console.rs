//! The `console-log` worker: copies a serial device into a log file.
//!
//! Runs detached under daemon(8) for the lifetime of a VM and is stopped
//! with SIGKILL, so it keeps no state worth flushing.

use anyhow::Context;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const BAUD: BaudRate = BaudRate::B115200;
const IDLE_WAIT: Duration = Duration::from_millis(200);

/// Puts the port in raw 8-bit mode at 115200 baud with blocking reads.
fn configure_serial(port: &File) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(port)?;

    // Equivalent to cfmakeraw()
    tio.input_flags.remove(
        InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON,
    );
    tio.output_flags.remove(OutputFlags::OPOST);
    tio.local_flags.remove(
        LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN,
    );
    tio.control_flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    tio.control_flags.insert(ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL);

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::cfsetspeed(&mut tio, BAUD)?;
    termios::tcsetattr(port, SetArg::TCSANOW, &tio)
}

/// Appends everything read from `device` to `log_file`. Returns only on error.
pub fn log_serial(device: &Path, log_file: &Path) -> anyhow::Result<()> {
    let mut port = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .with_context(|| format!("failed to open {}", device.display()))?;
    configure_serial(&port)
        .with_context(|| format!("failed to configure {}", device.display()))?;
    debug!("logging {} to {}", device.display(), log_file.display());

    copy_chunks(&mut port, log_file)
}

/// Copies `reader` into `log_file` chunk by chunk, reopening the file for
/// each chunk so it can be rotated or removed underneath.
fn copy_chunks(reader: &mut impl Read, log_file: &Path) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            // The guest end is not open yet; nmdm reports that as EOF.
            Ok(0) => {
                std::thread::sleep(IDLE_WAIT);
                continue;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("serial read failed"),
        };

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("failed to open {}", log_file.display()))?;
        log.write_all(&buf[..n])?;
    }
}
