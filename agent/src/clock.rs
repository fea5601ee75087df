//! One-shot host clock adjustment from the modem's network time.
//!
//! Cameras in the field have no RTC battery, so after a cold boot the host
//! clock is far in the past until NTP gets through. The modem learns
//! network time as soon as it registers, which is much earlier. We set the
//! host clock from it exactly once per boot cycle, tracked by a marker
//! file, so a later NTP-disciplined clock is never stomped.

use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Utc};
use eyre::{Result, bail};
use tracing::{info, warn};

/// Sets the host clock from `modem_time` unless `marker` shows it was
/// already done. Returns true when the clock was actually set.
pub fn sync_host_clock(utc: DateTime<Utc>, marker: &Path) -> Result<bool> {
    if marker.exists() {
        return Ok(false);
    }
    set_system_clock(&utc)?;
    if let Some(dir) = marker.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(marker, utc.to_rfc3339())?;
    info!(time = %utc, "host clock set from modem network time");
    Ok(true)
}

fn set_system_clock(utc: &DateTime<Utc>) -> Result<()> {
    // date(1) [MMDDhhmm[[CC]YY][.ss]]
    let stamp = utc.format("%m%d%H%M%Y.%S").to_string();
    let status = Command::new("date").args(["--utc", stamp.as_str()]).status()?;
    if !status.success() {
        warn!(%stamp, "date(1) rejected the timestamp");
        bail!("setting system clock failed with {status}");
    }
    Ok(())
}
