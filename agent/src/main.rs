//! `telit-agentd`: keeps the modem's data connection alive and the cached
//! GPS location fresh.
//!
//! Two worker threads share nothing but the config: the GPS monitor owns
//! the GPS serial port and the location store, the ECM monitor owns the
//! control port. Each opens a fresh session per cycle so a wedged port
//! never poisons the next round.

use std::thread;
use std::time::Duration;

use clap::Parser;
use eyre::{Result, bail};
use telit_modem::{EcmController, GpsReceiver, Session, probe};
use tracing::{error, info, warn};

use telit_agent::config::{Cli, Config};
use telit_agent::store::{FileKvStore, LocationStore};
use telit_agent::{clock, net};

const PERIODIC_ACQUIRE_ATTEMPTS: u32 = 2;
/// Backoff before reopening the GPS session after a failed converge.
const CONVERGE_RETRY_DELAY: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    color_eyre::install()?;
    telit_agent::init_telemetry();
    let config = Config::from_cli(Cli::parse());

    if !probe::modem_present() {
        // Not every camera carries a modem card. Nothing to supervise.
        info!("no modem card detected, exiting");
        return Ok(());
    }
    for device in [&config.gps_device, &config.ecm_device] {
        if !probe::device_exists(device) {
            bail!("modem card present but {device} is missing");
        }
    }

    let gps_config = config.clone();
    let gps = thread::Builder::new()
        .name("gps-monitor".into())
        .spawn(move || gps_monitor(gps_config))?;
    let ecm_config = config.clone();
    let ecm = thread::Builder::new()
        .name("ecm-monitor".into())
        .spawn(move || ecm_monitor(ecm_config))?;

    // The workers only return on panic.
    let _ = gps.join();
    let _ = ecm.join();
    bail!("a monitor thread exited");
}

fn gps_monitor(config: Config) {
    let mut store = open_store(&config);
    match store.seed_from_file(&config.seed_file) {
        Ok(true) => info!("location store seeded"),
        Ok(false) => {}
        Err(err) => warn!(?err, "ignoring unreadable seed file"),
    }

    // Block here until a decoded fix is actually in the store, however
    // long the sky view takes; only then drop to the periodic cadence.
    while let Err(err) = initial_converge(&config, &mut store) {
        error!(?err, "initial GPS convergence interrupted");
        thread::sleep(CONVERGE_RETRY_DELAY);
    }
    loop {
        thread::sleep(config.check_interval);
        if let Err(err) = gps_cycle(&config, &mut store) {
            error!(?err, "GPS check failed");
        }
    }
}

/// One open-ended converge: polls until a fix meets the HDOP target,
/// recording every improving fix along the way.
fn initial_converge(config: &Config, store: &mut LocationStore) -> Result<()> {
    let mut session = Session::connect(&config.gps_device)?;
    let mut receiver = GpsReceiver::new(&mut session);
    if !receiver.power()? {
        receiver.set_power(true)?;
    }
    receiver.acquire_until(config.target_hdop, |fix| {
        if let Err(err) = store.record(fix) {
            warn!(?err, "could not persist fix");
        }
    })?;
    receiver.set_power(false)?;
    session.close();
    Ok(())
}

fn gps_cycle(config: &Config, store: &mut LocationStore) -> Result<()> {
    let mut session = Session::connect(&config.gps_device)?;
    let mut receiver = GpsReceiver::new(&mut session);
    if !receiver.power()? {
        receiver.set_power(true)?;
    }
    let polled = receiver.acquire(config.target_hdop, PERIODIC_ACQUIRE_ATTEMPTS)?;
    receiver.set_power(false)?;
    match polled {
        Some(fix) => {
            store.record(&fix)?;
        }
        None => info!(
            attempts = PERIODIC_ACQUIRE_ATTEMPTS,
            "no usable fix this cycle"
        ),
    }
    session.close();
    Ok(())
}

fn ecm_monitor(config: Config) {
    loop {
        if let Err(err) = ecm_cycle(&config) {
            error!(?err, "ECM check failed");
        }
        thread::sleep(config.check_interval);
    }
}

fn ecm_cycle(config: &Config) -> Result<()> {
    if net::is_reachable(&config.probe_host)? {
        return Ok(());
    }
    warn!(host = %config.probe_host, "unreachable, restarting the data connection");

    let mut session = Session::connect(&config.ecm_device)?;
    {
        let mut ecm = EcmController::new(&mut session);
        if ecm.is_up()? {
            ecm.stop()?;
        }
        ecm.start()?;
    }

    // Interface renegotiation takes a moment before DHCP settles.
    thread::sleep(Duration::from_secs(5));
    if net::is_reachable(&config.probe_host)? {
        info!("data connection restored");
        match session.utc_clock() {
            Ok(now) => {
                if let Err(err) = clock::sync_host_clock(now, &config.clock_marker) {
                    warn!(?err, "host clock sync failed");
                }
            }
            Err(err) => warn!(?err, "modem clock unavailable"),
        }
    } else {
        warn!("restart did not restore connectivity");
    }
    session.close();
    Ok(())
}

fn open_store(config: &Config) -> LocationStore {
    let store = LocationStore::open(&config.location_file);
    match FileKvStore::open(&config.kv_file) {
        Ok(kv) => store.with_kv(Box::new(kv)),
        Err(err) => {
            warn!(?err, "state mirror unavailable, caching location only");
            store
        }
    }
}
