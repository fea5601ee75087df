//! `telit-gps`: poll the modem's GPS receiver from the command line.

use clap::Parser;
use eyre::{Result, bail};
use telit_modem::{GpsFix, GpsReceiver, Session, probe};
use tracing::warn;

/// Print GPS fixes from the modem.
#[derive(Debug, Parser)]
#[command(name = "telit-gps", about, version)]
struct Cli {
    /// Serial device carrying GPS traffic.
    #[arg(long, env = "TELIT_GPS_DEVICE", default_value = "/dev/ttyUSB3")]
    device: String,
    /// HDOP at or below which a fix is considered good enough.
    #[arg(long, default_value_t = 2.0)]
    hdop: f64,
    /// Poll attempts per fix before giving up.
    #[arg(long, default_value_t = 40)]
    retries: u32,
    /// How many fixes to print before exiting.
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Poll forever, printing each improving fix, until HDOP reaches this.
    #[arg(long, conflicts_with_all = ["hdop", "count"])]
    until: Option<f64>,
    /// Also print the SIM ICCID and signal strength before polling.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    telit_agent::init_telemetry();
    let cli = Cli::parse();

    if !probe::modem_present() {
        bail!("no modem card detected");
    }
    if !probe::device_exists(&cli.device) {
        bail!("{} does not exist", cli.device);
    }

    let mut session = Session::connect(&cli.device)?;
    if cli.verbose {
        let iccid = session.iccid()?;
        let signal = session.signal_strength()?;
        println!("{}", identity_banner(iccid, signal));
    }
    let mut receiver = GpsReceiver::new(&mut session);

    let was_on = receiver.power()?;
    if !was_on {
        receiver.set_power(true)?;
    }

    if let Some(target) = cli.until {
        receiver.acquire_until(target, print_fix)?;
    } else {
        for _ in 0..cli.count {
            match receiver.acquire(cli.hdop, cli.retries)? {
                Some(fix) => print_fix(&fix),
                None => warn!(retries = cli.retries, "no usable fix"),
            }
        }
    }

    if !was_on {
        receiver.set_power(false)?;
    }
    session.close();
    Ok(())
}

fn identity_banner(iccid: u64, signal: Option<f64>) -> String {
    match signal {
        Some(s) => format!("iccid {iccid} signal {:.0}%", s * 100.0),
        None => format!("iccid {iccid} signal unknown"),
    }
}

fn print_fix(fix: &GpsFix) {
    println!(
        "{:.6} {:.6} alt {:.1}m hdop {:.1} sats {}+{} at {} {}",
        fix.latitude,
        fix.longitude,
        fix.altitude,
        fix.hdop,
        fix.nsat_gps,
        fix.nsat_glonass,
        fix.date,
        fix.utc,
    );
}
