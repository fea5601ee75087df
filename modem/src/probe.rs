//! One-shot presence detection for the modem hardware.

use std::path::Path;
use std::process::Command;

use tracing::warn;

/// USB vendor string the LE910 enumerates under.
pub const TELIT_USB_VENDOR: &str = "Telit Wireless Solutions";

/// Whether a Telit module is enumerated on USB. Absence of `lsusb` itself
/// counts as absent hardware.
pub fn modem_present() -> bool {
    match Command::new("lsusb").output() {
        Ok(out) => {
            String::from_utf8_lossy(&out.stdout).contains(TELIT_USB_VENDOR)
        }
        Err(err) => {
            warn!(%err, "could not run lsusb");
            false
        }
    }
}

/// Whether the serial device node exists.
pub fn device_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}
