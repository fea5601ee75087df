//! Connectivity probing over the ECM interface.

use std::process::Command;
use std::sync::LazyLock;

use eyre::{Result, WrapErr};
use regex::Regex;
use tracing::debug;

static RECEIVED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ([0-9]+) received, ").unwrap());

/// Pings `host` and returns how many of the 5 probes came back. A host
/// that cannot be resolved counts as zero received rather than an error;
/// DNS failure is exactly the symptom we are probing for.
pub fn ping_received(host: &str) -> Result<u32> {
    let output = Command::new("ping")
        .args(["-i", "0.4", "-c", "5", host])
        .output()
        .wrap_err("spawning ping")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let received = RECEIVED_RE
        .captures(&stdout)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0);
    debug!(host, received, "ping probe");
    Ok(received)
}

/// True when at least one probe came back.
pub fn is_reachable(host: &str) -> Result<bool> {
    Ok(ping_received(host)? > 0)
}
