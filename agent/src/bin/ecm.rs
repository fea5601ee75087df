//! `telit-ecm`: manage the modem's Ethernet-over-USB data connection.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use eyre::{Result, bail};
use telit_modem::{EcmController, Session, probe};
use tracing::{info, warn};

use telit_agent::store::{FileKvStore, KvStore as _};
use telit_agent::{clock, net};

/// USB personality exposing the ECM network interface.
const ECM_USB_CONFIG: u32 = 4;

/// Control the modem's data connection.
#[derive(Debug, Parser)]
#[command(name = "telit-ecm", about, version)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["start", "stop", "check"])
))]
struct Cli {
    /// Serial device carrying ECM control traffic.
    #[arg(long, env = "TELIT_ECM_DEVICE", default_value = "/dev/ttyUSB2")]
    device: String,
    /// Bring the data connection up, reconfiguring the modem as needed.
    #[arg(long)]
    start: bool,
    /// Take the data connection down.
    #[arg(long)]
    stop: bool,
    /// Report whether the connection is up and passing traffic.
    #[arg(long)]
    check: bool,
    /// Also set the host clock from modem network time.
    #[arg(long, requires = "start")]
    setclock: bool,
    /// Carrier APN written into packet context 1.
    #[arg(long, default_value = "super")]
    apn: String,
    /// Host pinged to verify the connection.
    #[arg(long, default_value = "sixfab.com")]
    probe_host: String,
    /// Key-value store the SIM identity is recorded in.
    #[arg(long, default_value = "/var/lib/telit/state.json")]
    kv_file: PathBuf,
    /// Marker recording that the host clock was already set this boot.
    #[arg(long, default_value = "/run/telit/clock-synced")]
    clock_marker: PathBuf,
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
    let result = if cli.stop {
        stop(&mut session)
    } else if cli.check {
        check(&mut session, &cli.probe_host)
    } else {
        start(&mut session, &cli)
    };
    session.close();
    result
}

fn stop(session: &mut Session) -> Result<()> {
    let mut ecm = EcmController::new(session);
    if ecm.is_up()? {
        ecm.stop()?;
        info!("data connection stopped");
    } else {
        info!("data connection already down");
    }
    Ok(())
}

fn check(session: &mut Session, probe_host: &str) -> Result<()> {
    let mut ecm = EcmController::new(session);
    if !ecm.is_up()? {
        bail!("data connection is down");
    }
    if !net::is_reachable(probe_host)? {
        bail!("data connection is up but {probe_host} is unreachable");
    }
    println!("up, {probe_host} reachable");
    Ok(())
}

fn start(session: &mut Session, cli: &Cli) -> Result<()> {
    {
        let mut ecm = EcmController::new(session);

        let context = ecm.read_context()?;
        if context.apn != cli.apn {
            info!(from = %context.apn, to = %cli.apn, "rewriting packet context");
            ecm.write_context("IP", &cli.apn)?;
        }

        // The personality write makes the modem self-reset; the controller
        // rides through the reboot and re-handshakes.
        let usb = ecm.usb_config()?;
        if usb != ECM_USB_CONFIG {
            info!(from = usb, to = ECM_USB_CONFIG, "switching USB personality");
            ecm.apply_usb_config(ECM_USB_CONFIG)?;
        }

        if !ecm.is_up()? {
            ecm.start()?;
        }
    }

    thread::sleep(Duration::from_secs(5));
    if !net::is_reachable(&cli.probe_host)? {
        bail!("started, but {} is unreachable", cli.probe_host);
    }
    info!(host = %cli.probe_host, "data connection verified");

    let iccid = session.iccid()?;
    let mut kv = FileKvStore::open(&cli.kv_file)?;
    kv.set("ID", &format!("iccid:{iccid}"))?;

    if cli.setclock {
        match session.utc_clock() {
            Ok(now) => {
                clock::sync_host_clock(now, &cli.clock_marker)?;
            }
            Err(err) => warn!(?err, "modem clock unavailable, skipping sync"),
        }
    }
    Ok(())
}
