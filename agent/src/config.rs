//! Daemon configuration, assembled from CLI flags and environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Long-running supervisor for the cellular modem: keeps the ECM data
/// connection up and the last-known GPS location fresh.
#[derive(Debug, Parser)]
#[command(name = "telit-agentd", about, version)]
pub struct Cli {
    /// Serial device carrying GPS traffic.
    #[arg(long, env = "TELIT_GPS_DEVICE", default_value = "/dev/ttyUSB3")]
    pub gps_device: String,
    /// Serial device carrying ECM control traffic.
    #[arg(long, env = "TELIT_ECM_DEVICE", default_value = "/dev/ttyUSB2")]
    pub ecm_device: String,
    /// Seconds between periodic GPS and connectivity checks.
    #[arg(long, default_value_t = 900)]
    pub check_interval: u64,
    /// Host pinged to judge whether the data connection works.
    #[arg(long, default_value = "sixfab.com")]
    pub probe_host: String,
    /// HDOP at or below which the initial acquisition loop stops.
    #[arg(long, default_value_t = 2.0)]
    pub target_hdop: f64,
    /// Where the last-known location record is cached.
    #[arg(long, default_value = "/var/lib/telit/location.json")]
    pub location_file: PathBuf,
    /// Provisioned location seed, read once at startup if present.
    #[arg(long, default_value = "/etc/telit/seed-location.json")]
    pub seed_file: PathBuf,
    /// Key-value mirror other processes read location fields from.
    #[arg(long, default_value = "/var/lib/telit/state.json")]
    pub kv_file: PathBuf,
    /// Marker recording that the host clock was already set this boot.
    #[arg(long, default_value = "/run/telit/clock-synced")]
    pub clock_marker: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gps_device: String,
    pub ecm_device: String,
    pub check_interval: Duration,
    pub probe_host: String,
    pub target_hdop: f64,
    pub location_file: PathBuf,
    pub seed_file: PathBuf,
    pub kv_file: PathBuf,
    pub clock_marker: PathBuf,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        Self {
            gps_device: cli.gps_device,
            ecm_device: cli.ecm_device,
            check_interval: Duration::from_secs(cli.check_interval),
            probe_host: cli.probe_host,
            target_hdop: cli.target_hdop,
            location_file: cli.location_file,
            seed_file: cli.seed_file,
            kv_file: cli.kv_file,
            clock_marker: cli.clock_marker,
        }
    }
}
