//! Command engine: the request/response automaton on top of a channel.
//!
//! A [`Session`] is the exclusive owner of one channel bound to one device
//! path; open exactly one per device at a time. Each command cycle is
//! `Idle -> Sent -> {Matched, ErrorSeen, TimedOut}`, terminal in one cycle.
//! The engine never retries on its own; retry policy belongs to callers
//! (the handshake loop here, the GPS acquisition loop, the daemon).

use std::io::{Read, Write};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::error::{ModemError, Result};
use crate::serial::{Channel, Match, Pattern, SerialChannel};

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const OK_TERMINATOR: &str = "OK\r\n";
const ERROR_TERMINATOR: &str = "ERROR\r\n";

/// Backoff between liveness probes while the modem is still booting.
const HANDSHAKE_BACKOFF: Duration = Duration::from_millis(500);
const HANDSHAKE_ATTEMPTS: u32 = 10;

/// The modem is dark for tens of seconds after a reboot-class command and
/// must not be probed during that window.
const REBOOT_SETTLE: Duration = Duration::from_secs(30);
/// After the settle, the old channel has this long to die (EOF).
const EOF_WINDOW: Duration = Duration::from_secs(30);

static ICCID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+ICCID:\s+([0-9]+)\r\n").expect("valid regex")
});
static IMEISV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+IMEISV:\s+([0-9]+)\r\n").expect("valid regex")
});
static CSQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+CSQ:\s+([0-9]+),[0-9]+\r\n").expect("valid regex")
});
static CCLK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\+CCLK:\s+"([-0-9/,:+]+)"\r\n"#).expect("valid regex")
});

/// Tagged result of one wait-for-terminator cycle. Never partially valid: a
/// data match either fully satisfied the expected pattern or the outcome is
/// one of the other variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The `OK` terminator.
    Ok,
    /// The modem reported `ERROR`.
    ErrorReported,
    /// The wait window expired.
    TimedOut,
    /// The expected data pattern matched; payload is its capture group.
    DataMatched(String),
}

/// Where the session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Channel open, handshake not yet run.
    NotStarted,
    /// Handshake confirmed the modem is answering.
    Open,
    /// Channel released.
    Closed,
}

/// One command session with the modem. Generic over the transport so the
/// protocol automaton can be exercised against a scripted port.
pub struct Session<T: Read + Write = Box<dyn SerialPort>> {
    channel: Channel<T>,
    timeout: Duration,
    liveness: Liveness,
    device: Option<String>,
    baud: u32,
    handshake_backoff: Duration,
    reboot_settle: Duration,
    eof_window: Duration,
}

impl Session {
    /// Opens the serial device and wraps it in a session. The modem may
    /// still be booting; run [`Session::handshake`] before anything else.
    pub fn open(device: &str, baud: u32, timeout: Duration) -> Result<Self> {
        let channel = SerialChannel::open(device, baud)?;
        let mut session = Self::with_channel(channel, timeout);
        session.device = Some(device.to_owned());
        session.baud = baud;
        Ok(session)
    }

    /// Opens with the default baud rate and timeout and runs the handshake.
    pub fn connect(device: &str) -> Result<Self> {
        let mut session = Self::open(device, DEFAULT_BAUD, DEFAULT_TIMEOUT)?;
        session.handshake(HANDSHAKE_ATTEMPTS)?;
        Ok(session)
    }

    /// Full post-reboot recovery, to run after any reboot-class command:
    /// settle through the blackout, require the old channel to die, then
    /// replace it and re-handshake. A reboot invalidates the channel itself,
    /// not just the command state, so this is modeled as channel replacement
    /// rather than one more command.
    pub(crate) fn resync_after_reset(&mut self) -> Result<()> {
        let device = self.device.clone().ok_or_else(|| {
            ModemError::TransportUnavailable(
                "no device path to reconnect to".into(),
            )
        })?;
        self.await_channel_death()?;
        self.channel.close();
        info!(device, "reconnecting after modem reset");
        self.channel = SerialChannel::open(&device, self.baud)?;
        self.liveness = Liveness::NotStarted;
        thread::sleep(Duration::from_millis(500));
        self.handshake(HANDSHAKE_ATTEMPTS)
    }
}

impl<T: Read + Write> Session<T> {
    /// Wraps an already-open channel. Used by tests and by transports that
    /// are not a local serial device.
    pub fn with_channel(channel: Channel<T>, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            liveness: Liveness::NotStarted,
            device: None,
            baud: DEFAULT_BAUD,
            handshake_backoff: HANDSHAKE_BACKOFF,
            reboot_settle: REBOOT_SETTLE,
            eof_window: EOF_WINDOW,
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Overrides the handshake backoff and the post-reboot settle/EOF
    /// windows. The defaults suit the LE910; tests shrink them.
    pub fn set_recovery_timing(
        &mut self,
        handshake_backoff: Duration,
        reboot_settle: Duration,
        eof_window: Duration,
    ) {
        self.handshake_backoff = handshake_backoff;
        self.reboot_settle = reboot_settle;
        self.eof_window = eof_window;
    }

    /// Repeatedly sends a bare `AT` until the modem answers `OK`, waiting
    /// out boot time. Must be the first operation on any fresh channel.
    pub fn handshake(&mut self, max_attempts: u32) -> Result<()> {
        // Clear any half-typed input on the line first.
        self.channel.send("")?;
        thread::sleep(Duration::from_millis(100));

        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, "liveness probe");
            self.channel.send("AT")?;
            match self.wait_outcome(None)? {
                CommandOutcome::Ok => {
                    self.liveness = Liveness::Open;
                    return Ok(());
                }
                CommandOutcome::TimedOut => {
                    thread::sleep(self.handshake_backoff);
                }
                CommandOutcome::ErrorReported => {
                    return Err(ModemError::Protocol(
                        "ERROR in reply to a bare AT probe".into(),
                    ));
                }
                CommandOutcome::DataMatched(_) => {}
            }
        }
        warn!(max_attempts, "modem never answered the liveness probe");
        Err(ModemError::Timeout)
    }

    /// Sends `command` and waits for the data pattern followed by the
    /// trailing `OK`. A terminator arriving before any data match is a
    /// protocol error, never a silent empty result.
    pub fn run(&mut self, command: &str, pattern: &Regex) -> Result<String> {
        debug!(%command, "run");
        self.channel.send(command)?;
        match self.wait_outcome(Some(pattern))? {
            CommandOutcome::DataMatched(text) => {
                self.confirm_ok(command)?;
                Ok(text)
            }
            CommandOutcome::Ok => Err(ModemError::Protocol(format!(
                "'{command}' terminated before any data matched"
            ))),
            CommandOutcome::ErrorReported => Err(ModemError::Protocol(format!(
                "modem returned ERROR for '{command}'"
            ))),
            CommandOutcome::TimedOut => Err(ModemError::Timeout),
        }
    }

    /// Sends a command that carries no data payload and waits for `OK`.
    pub fn run_void(&mut self, command: &str) -> Result<()> {
        debug!(%command, "run_void");
        self.channel.send(command)?;
        self.confirm_ok(command)
    }

    /// Sends a command without waiting for anything. Only reboot-class
    /// commands use this; everything else wants a terminator.
    pub(crate) fn send_unchecked(&mut self, command: &str) -> Result<()> {
        debug!(%command, "send (no wait)");
        self.channel.send(command)
    }

    /// One wait-for-terminator cycle: data pattern (if any), `OK`, `ERROR`,
    /// or window expiry, mapped to a [`CommandOutcome`].
    pub fn wait_outcome(&mut self, pattern: Option<&Regex>) -> Result<CommandOutcome> {
        let m = match pattern {
            Some(re) => self.channel.expect(
                &[
                    Pattern::Timeout,
                    Pattern::Data(re),
                    Pattern::Literal(OK_TERMINATOR),
                    Pattern::Literal(ERROR_TERMINATOR),
                ],
                self.timeout,
            )?,
            None => self.channel.expect(
                &[
                    Pattern::Timeout,
                    Pattern::Literal(OK_TERMINATOR),
                    Pattern::Literal(ERROR_TERMINATOR),
                ],
                self.timeout,
            )?,
        };
        Ok(match (pattern.is_some(), m) {
            (_, Match::TimedOut) => CommandOutcome::TimedOut,
            (true, Match::Data(_, text)) => CommandOutcome::DataMatched(text),
            (true, Match::Literal(2)) | (false, Match::Literal(1)) => {
                CommandOutcome::Ok
            }
            (_, _) => CommandOutcome::ErrorReported,
        })
    }

    fn confirm_ok(&mut self, command: &str) -> Result<()> {
        match self.wait_outcome(None)? {
            CommandOutcome::Ok => Ok(()),
            CommandOutcome::ErrorReported => Err(ModemError::Protocol(format!(
                "modem returned ERROR for '{command}'"
            ))),
            _ => Err(ModemError::Timeout),
        }
    }

    /// First phase of reboot recovery: sit out the blackout, then require
    /// the old channel to die before any reconnection is attempted. A
    /// timeout here means the session is unrecoverable; no re-handshake is
    /// attempted on a channel that was never confirmed dead.
    pub fn await_channel_death(&mut self) -> Result<()> {
        info!("modem resetting; expect a long blackout");
        thread::sleep(self.reboot_settle);
        self.channel.wait_for_eof(self.eof_window)
    }

    /// Releases the channel. Idempotent; also happens on drop.
    pub fn close(&mut self) {
        self.channel.close();
        self.liveness = Liveness::Closed;
    }

    // --- identity and status queries -----------------------------------

    /// SIM ICCID.
    pub fn iccid(&mut self) -> Result<u64> {
        let text = self.run("AT+ICCID", &ICCID_RE)?;
        text.parse()
            .map_err(|_| ModemError::DataFormat(format!("bad ICCID '{text}'")))
    }

    /// Device IMEI. The modem reports the software-version variant; the
    /// trailing two digits are dropped to get the true IMEI.
    pub fn imei(&mut self) -> Result<u64> {
        let text = self.run("AT+IMEISV", &IMEISV_RE)?;
        let imeisv: u64 = text
            .parse()
            .map_err(|_| ModemError::DataFormat(format!("bad IMEISV '{text}'")))?;
        Ok(imeisv / 100)
    }

    /// Signal strength normalized to `0.0..=1.0`, or `None` when the modem
    /// reports a value outside both defined scales.
    pub fn signal_strength(&mut self) -> Result<Option<f64>> {
        let text = self.run("AT+CSQ", &CSQ_RE)?;
        let raw: u32 = text
            .parse()
            .map_err(|_| ModemError::DataFormat(format!("bad CSQ '{text}'")))?;
        Ok(map_signal(raw))
    }

    /// Modem RTC in whatever zone the RTC is set to.
    pub fn clock(&mut self) -> Result<DateTime<FixedOffset>> {
        let text = self.run("AT+CCLK?", &CCLK_RE)?;
        decode_clock(&text)
    }

    /// Modem RTC normalized to UTC.
    pub fn utc_clock(&mut self) -> Result<DateTime<Utc>> {
        Ok(self.clock()?.with_timezone(&Utc))
    }
}

/// Maps a raw CSQ value onto `0.0..=1.0`. The LE910 uses either the 0-31
/// scale or the extended 100-191 scale.
pub fn map_signal(raw: u32) -> Option<f64> {
    match raw {
        0..=31 => Some(f64::from(raw) / 31.0),
        100..=191 => Some(f64::from(raw - 100) / 91.0),
        _ => None,
    }
}

/// Unwraps one matching pair of surrounding double quotes; anything else is
/// returned unmodified.
pub fn strip_quotes(buf: &str) -> &str {
    if buf.len() >= 2 && buf.starts_with('"') && buf.ends_with('"') {
        &buf[1..buf.len() - 1]
    } else {
        buf
    }
}

/// Decodes the CCLK payload `YY/MM/DD,HH:MM:SS±ZZ`, where the zone offset
/// counts quarter hours.
fn decode_clock(raw: &str) -> Result<DateTime<FixedOffset>> {
    if raw.len() < 20 {
        return Err(ModemError::DataFormat(format!("short CCLK reply '{raw}'")));
    }
    let (stamp, zone) = raw.split_at(17);
    let quarters: i32 = zone.parse().map_err(|_| {
        ModemError::DataFormat(format!("bad CCLK zone offset '{zone}'"))
    })?;
    let offset = FixedOffset::east_opt(quarters * 900).ok_or_else(|| {
        ModemError::DataFormat(format!("CCLK zone offset out of range '{zone}'"))
    })?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%y/%m/%d,%H:%M:%S")
        .map_err(|_| ModemError::DataFormat(format!("bad CCLK stamp '{stamp}'")))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| ModemError::DataFormat(format!("ambiguous CCLK '{raw}'")))
}
