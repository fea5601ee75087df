//! GPS: position decoding and the quality-convergence acquisition loop.
//!
//! The modem reports position as a 12-field `$GPSACP` sentence. Only a
//! sentence with fix-quality `3` (valid 3D fix) is usable; anything else is
//! "no fix yet", not an error. Acquisition is best-effort and monotone: a
//! run never returns a worse fix than one it already decoded.

use std::io::{Read, Write};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::error::{ModemError, Result};
use crate::session::Session;

static GPSACP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$GPSACP:\s+([0-9A-Z,.]+)\r\n").expect("valid regex")
});
static GPSP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$GPSP:\s+([0-9])\r\n").expect("valid regex")
});

/// Delay between position requests within one acquisition run.
const RETRY_DELAY: Duration = Duration::from_secs(10);
/// Extra sleep in the continuous loop when no usable fix exists at all.
const NO_FIX_DELAY: Duration = Duration::from_secs(10);
/// Attempt cap for each batch of the continuous loop.
const CONTINUOUS_BATCH: u32 = 12;

/// The fix-quality code for a valid 3D fix; the only usable one.
const QUALITY_3D: &str = "3";

/// One decoded position fix.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    /// Degrees, north positive.
    pub latitude: f64,
    /// Degrees, east positive.
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: f64,
    /// Horizontal dilution of precision; lower is better.
    pub hdop: f64,
    /// Satellites in use, GPS constellation.
    pub nsat_gps: u32,
    /// Satellites in use, GLONASS constellation.
    pub nsat_glonass: u32,
    /// Raw UTC time field (`hhmmss.sss`) as the modem reported it.
    pub utc: String,
    /// Raw date field (`ddmmyy`) as the modem reported it.
    pub date: String,
}

/// Decodes a raw `$GPSACP` payload. `Ok(None)` means the sentence was well
/// formed but the modem has no valid 3D fix yet; a wrong field count is a
/// data-format error, never a partial fix.
pub fn decode_position(raw: &str) -> Result<Option<GpsFix>> {
    let fields: Vec<&str> = raw.split(',').collect();
    if fields.len() != 12 {
        return Err(ModemError::DataFormat(format!(
            "expected 12 position fields, got {} in '{raw}'",
            fields.len()
        )));
    }
    if fields[5] != QUALITY_3D {
        return Ok(None);
    }
    Ok(Some(GpsFix {
        latitude: parse_latitude(fields[1])?,
        longitude: parse_longitude(fields[2])?,
        altitude: parse_float(fields[4], "altitude")?,
        hdop: parse_float(fields[3], "hdop")?,
        nsat_gps: parse_count(fields[10], "gps satellite count")?,
        nsat_glonass: parse_count(fields[11], "glonass satellite count")?,
        utc: fields[0].to_owned(),
        date: fields[9].to_owned(),
    }))
}

/// Latitude comes as `DDMM.mmmm<N|S>`: a 2-digit degree prefix, fractional
/// minutes, and a trailing hemisphere letter.
fn parse_latitude(raw: &str) -> Result<f64> {
    parse_coordinate(raw, 2, ('N', 'S'))
}

/// Longitude is the same shape with a 3-digit degree prefix and `E`/`W`.
fn parse_longitude(raw: &str) -> Result<f64> {
    parse_coordinate(raw, 3, ('E', 'W'))
}

fn parse_coordinate(
    raw: &str,
    degree_digits: usize,
    (positive, negative): (char, char),
) -> Result<f64> {
    let bad =
        || ModemError::DataFormat(format!("bad coordinate field '{raw}'"));
    // The byte splits below are only safe on ASCII input.
    if !raw.is_ascii() || raw.len() <= degree_digits + 1 {
        return Err(bad());
    }
    let (body, dir) = raw.split_at(raw.len() - 1);
    let sign = match dir.chars().next() {
        Some(d) if d == positive => 1.0,
        Some(d) if d == negative => -1.0,
        _ => return Err(bad()),
    };
    let (deg_str, min_str) = body.split_at(degree_digits);
    let degrees: f64 = deg_str.parse().map_err(|_| bad())?;
    let minutes: f64 = min_str.parse().map_err(|_| bad())?;
    Ok(sign * (degrees + minutes / 60.0))
}

fn parse_float(raw: &str, what: &str) -> Result<f64> {
    raw.parse()
        .map_err(|_| ModemError::DataFormat(format!("bad {what} '{raw}'")))
}

fn parse_count(raw: &str, what: &str) -> Result<u32> {
    raw.parse()
        .map_err(|_| ModemError::DataFormat(format!("bad {what} '{raw}'")))
}

/// GPS operations on a session. Depends only on the command engine; knows
/// nothing about ECM.
pub struct GpsReceiver<'a, T: Read + Write = Box<dyn SerialPort>> {
    session: &'a mut Session<T>,
    retry_delay: Duration,
    no_fix_delay: Duration,
}

impl<'a, T: Read + Write> GpsReceiver<'a, T> {
    pub fn new(session: &'a mut Session<T>) -> Self {
        Self {
            session,
            retry_delay: RETRY_DELAY,
            no_fix_delay: NO_FIX_DELAY,
        }
    }

    /// Overrides the inter-attempt delays. Tests shrink them.
    #[must_use]
    pub fn with_delays(mut self, retry: Duration, no_fix: Duration) -> Self {
        self.retry_delay = retry;
        self.no_fix_delay = no_fix;
        self
    }

    /// Whether the GPS receiver is currently powered.
    pub fn power(&mut self) -> Result<bool> {
        let text = self.session.run("AT$GPSP?", &GPSP_RE)?;
        Ok(text == "1")
    }

    /// Powers the GPS receiver on or off.
    pub fn set_power(&mut self, on: bool) -> Result<()> {
        debug!(on, "setting GPS power");
        self.session.run_void(&format!("AT$GPSP={}", u8::from(on)))
    }

    /// Requests one position. `Ok(None)` when the modem has no usable fix.
    pub fn poll(&mut self) -> Result<Option<GpsFix>> {
        let raw = self.session.run("AT$GPSACP", &GPSACP_RE)?;
        decode_position(&raw)
    }

    /// Best-effort acquisition with quality convergence.
    ///
    /// Requests positions until one decodes with HDOP at or below
    /// `target_hdop` (returned immediately), retaining the best fix seen
    /// along the way. A per-poll timeout or a malformed sentence counts as a
    /// miss. After `max_attempts`, returns the best retained fix, or `None`
    /// if nothing usable was ever decoded.
    pub fn acquire(
        &mut self,
        target_hdop: f64,
        max_attempts: u32,
    ) -> Result<Option<GpsFix>> {
        let mut best: Option<GpsFix> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                thread::sleep(self.retry_delay);
            }

            let fix = match self.poll() {
                Ok(fix) => fix,
                Err(ModemError::Timeout) => {
                    debug!(attempt, "position request timed out");
                    None
                }
                Err(ModemError::DataFormat(reason)) => {
                    warn!(attempt, %reason, "malformed position sentence");
                    None
                }
                Err(e) => return Err(e),
            };

            let Some(fix) = fix else {
                debug!(attempt, max_attempts, "no usable fix yet");
                continue;
            };

            if fix.hdop <= target_hdop {
                info!(hdop = fix.hdop, attempt, "fix met the HDOP target");
                return Ok(Some(fix));
            }
            debug!(hdop = fix.hdop, target_hdop, attempt, "fix above target");
            if best.as_ref().is_none_or(|b| fix.hdop < b.hdop) {
                best = Some(fix);
            }
        }

        match &best {
            Some(fix) => info!(hdop = fix.hdop, "settling for the best fix seen"),
            None => info!("no usable fix this run"),
        }
        Ok(best)
    }

    /// Continuous acquisition for daemon use: loops until a fix meets
    /// `target_hdop`, publishing every strictly-improving fix through
    /// `publish` as it is found. Sleeps longer between batches while no fix
    /// at all is available than while refining an existing one.
    pub fn acquire_until(
        &mut self,
        target_hdop: f64,
        mut publish: impl FnMut(&GpsFix),
    ) -> Result<GpsFix> {
        let mut last: Option<GpsFix> = None;

        loop {
            match self.acquire(target_hdop, CONTINUOUS_BATCH)? {
                None => {
                    debug!("still no fix; backing off");
                    thread::sleep(self.no_fix_delay);
                }
                Some(fix) => {
                    let improving =
                        last.as_ref().is_none_or(|prev| fix.hdop < prev.hdop);
                    if improving {
                        publish(&fix);
                        if fix.hdop <= target_hdop {
                            return Ok(fix);
                        }
                        last = Some(fix);
                    }
                }
            }
        }
    }
}
