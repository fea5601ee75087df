//! Serial transport channel.
//!
//! Owns the line to the modem and implements the single primitive everything
//! else is built on: send a line, then block until one of an ordered set of
//! expected patterns shows up in the incoming stream. Timeout is a legitimate
//! member of the pattern set, not an implicit failure; callers that want to
//! branch on it include [`Pattern::Timeout`] explicitly.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serialport::SerialPort;
use tracing::{debug, trace};

use crate::error::{ModemError, Result};

/// Per-read poll interval on the underlying port.
const READ_CHUNK_TIMEOUT: Duration = Duration::from_millis(100);

/// The modem keeps writing for a short while after a response looks finished.
/// Closing sleeps this long before releasing the line so the tail of a
/// pending response is not truncated.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// One member of an expect set.
pub enum Pattern<'a> {
    /// Expiry of the wait window, as a first-class outcome.
    Timeout,
    /// Literal text anywhere in the incoming stream.
    Literal(&'a str),
    /// Regex whose first capture group is the payload of interest.
    Data(&'a Regex),
}

/// What `expect` saw first in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    /// The wait window expired and `Pattern::Timeout` was in the set.
    TimedOut,
    /// The literal at this index in the pattern set matched.
    Literal(usize),
    /// The data pattern at this index matched; payload is capture group 1.
    Data(usize, String),
}

/// A channel to the modem over anything byte-oriented. Production code uses
/// a serial port; tests drive it with a scripted in-memory port.
pub struct Channel<T: Read + Write> {
    port: T,
    buf: String,
    closed: bool,
}

/// The channel type bound to a real serial device.
pub type SerialChannel = Channel<Box<dyn SerialPort>>;

impl SerialChannel {
    /// Opens the serial device at the given baud rate.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .timeout(READ_CHUNK_TIMEOUT)
            .open()
            .map_err(|e| {
                ModemError::TransportUnavailable(format!("{device}: {e}"))
            })?;
        debug!(device, baud, "serial channel open");
        Ok(Channel::from_port(port))
    }
}

impl<T: Read + Write> Channel<T> {
    /// Wraps an already-open port.
    pub fn from_port(port: T) -> Self {
        Self {
            port,
            buf: String::new(),
            closed: false,
        }
    }

    /// Sends one command line, CR-terminated.
    pub fn send(&mut self, line: &str) -> Result<()> {
        trace!(%line, "tx");
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r")?;
        self.port.flush()?;
        Ok(())
    }

    /// Blocks until one of `patterns` appears in the incoming stream, or the
    /// wait window expires.
    ///
    /// Whichever pattern matches earliest in the stream wins; ties are broken
    /// by pattern order. The buffer is consumed through the end of the match,
    /// so repeated calls walk forward through the stream. If the window
    /// expires and `Pattern::Timeout` is in the set, `Match::TimedOut` is
    /// returned; otherwise expiry is an error.
    pub fn expect(
        &mut self,
        patterns: &[Pattern<'_>],
        timeout: Duration,
    ) -> Result<Match> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(m) = self.scan(patterns) {
                return Ok(m);
            }
            if Instant::now() >= deadline {
                trace!(buffered = self.buf.len(), "expect window expired");
                if patterns.iter().any(|p| matches!(p, Pattern::Timeout)) {
                    return Ok(Match::TimedOut);
                }
                return Err(ModemError::Timeout);
            }
            self.fill()?;
        }
    }

    /// Finds the earliest-starting match among the patterns and consumes the
    /// buffer through its end.
    fn scan(&mut self, patterns: &[Pattern<'_>]) -> Option<Match> {
        let mut best: Option<(usize, usize, Match)> = None;
        for (idx, pattern) in patterns.iter().enumerate() {
            let candidate = match pattern {
                Pattern::Timeout => None,
                Pattern::Literal(lit) => self
                    .buf
                    .find(lit)
                    .map(|at| (at, at + lit.len(), Match::Literal(idx))),
                Pattern::Data(re) => re.captures(&self.buf).map(|caps| {
                    let whole = caps.get(0).expect("capture 0 always present");
                    let payload = caps
                        .get(1)
                        .map(|m| m.as_str().to_owned())
                        .unwrap_or_default();
                    (whole.start(), whole.end(), Match::Data(idx, payload))
                }),
            };
            if let Some((start, end, m)) = candidate {
                let better = best
                    .as_ref()
                    .is_none_or(|(best_start, _, _)| start < *best_start);
                if better {
                    best = Some((start, end, m));
                }
            }
        }
        let (_, end, m) = best?;
        self.buf.drain(..end);
        Some(m)
    }

    /// Pulls one chunk off the port into the buffer. A per-read timeout is
    /// not an error, just an empty poll. End-of-stream mid-command means
    /// the device went away under us, which no amount of waiting fixes.
    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 512];
        match self.port.read(&mut chunk) {
            Ok(0) => Err(ModemError::TransportUnavailable(
                "end of stream while waiting for a reply".into(),
            )),
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                trace!(rx = %text, "rx");
                self.buf.push_str(&text);
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for the transport to report end-of-stream, as happens when the
    /// device node dies across a modem reset. Incoming data during the window
    /// is discarded. Not observing EOF within the window is a hard timeout.
    pub fn wait_for_eof(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut chunk = [0u8; 512];
            match self.port.read(&mut chunk) {
                Ok(0) => {
                    debug!("end of stream observed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    // The device going away entirely also counts as EOF.
                    debug!(error = %e, "channel died");
                    return Ok(());
                }
            }
        }
        Err(ModemError::Timeout)
    }

    /// Flushes and releases the line. Idempotent; also runs on drop, so the
    /// settle delay fires on every exit path.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.port.flush();
        thread::sleep(SETTLE_DELAY);
        debug!("serial channel closed");
    }
}

impl<T: Read + Write> Drop for Channel<T> {
    fn drop(&mut self) {
        self.close();
    }
}
