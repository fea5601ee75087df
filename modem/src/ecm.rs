//! ECM: the Ethernet-over-USB data bridge and its packet-context setup.

use std::io::{Read, Write};
use std::sync::LazyLock;

use regex::Regex;
use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::{ModemError, Result};
use crate::session::{strip_quotes, CommandOutcome, Session};

static CGDCONT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\+CGDCONT:\s+([0-9A-Za-z,"]+)\r\n"#).expect("valid regex")
});
static ECMC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"#ECMC:\s+([0-9A-Za-z,."]+)\r\n"#).expect("valid regex")
});
static USBCFG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#USBCFG:\s+([0-9]+)\r\n").expect("valid regex")
});

/// The only packet context this system manages.
const MANAGED_CONTEXT_ID: &str = "1";

/// Ordered field list from the ECM status query. Field 1 is the up/down
/// flag; everything else is passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcmConfig(Vec<String>);

impl EcmConfig {
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// Whether the bridge is up: field 1 is the literal `"1"`. Anything
    /// else, including an empty field, means down.
    pub fn is_up(&self) -> bool {
        self.0.get(1).is_some_and(|v| v == "1")
    }
}

/// The managed packet-context row: context id 1's IP type and APN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnContext {
    pub ip_type: String,
    pub apn: String,
}

/// ECM operations on a session. Depends only on the command engine; knows
/// nothing about GPS.
pub struct EcmController<'a, T: Read + Write = Box<dyn SerialPort>> {
    session: &'a mut Session<T>,
}

impl<'a, T: Read + Write> EcmController<'a, T> {
    pub fn new(session: &'a mut Session<T>) -> Self {
        Self { session }
    }

    /// Reads the packet-context configuration for context id 1.
    ///
    /// The modem emits zero or more `+CGDCONT` rows, interleaved with rows
    /// for other contexts, before the terminating `OK`; events are consumed
    /// until the terminator and only the managed context's row is retained.
    pub fn read_context(&mut self) -> Result<ApnContext> {
        self.session.send_unchecked("AT+CGDCONT?")?;
        let mut retained: Option<ApnContext> = None;

        loop {
            match self.session.wait_outcome(Some(&CGDCONT_RE))? {
                CommandOutcome::DataMatched(row) => {
                    debug!(%row, "context row");
                    let fields: Vec<&str> = row.split(',').collect();
                    if fields.len() >= 4 && fields[0] == MANAGED_CONTEXT_ID {
                        retained = Some(ApnContext {
                            ip_type: strip_quotes(fields[1]).to_owned(),
                            apn: strip_quotes(fields[2]).to_owned(),
                        });
                    }
                }
                CommandOutcome::Ok => break,
                CommandOutcome::ErrorReported => {
                    return Err(ModemError::Protocol(
                        "modem returned ERROR for 'AT+CGDCONT?'".into(),
                    ));
                }
                CommandOutcome::TimedOut => return Err(ModemError::Timeout),
            }
        }

        retained.ok_or_else(|| {
            ModemError::DataFormat(format!(
                "no +CGDCONT row for context {MANAGED_CONTEXT_ID}"
            ))
        })
    }

    /// Writes the packet context for context id 1. Typical values are
    /// `"IP"` and the carrier's APN.
    pub fn write_context(&mut self, ip_type: &str, apn: &str) -> Result<()> {
        self.session
            .run_void(&format!("AT+CGDCONT=1,\"{ip_type}\",\"{apn}\""))
    }

    /// Queries the ECM status row.
    pub fn status(&mut self) -> Result<EcmConfig> {
        let raw = self.session.run("AT#ECMC?", &ECMC_RE)?;
        let fields: Vec<String> = raw
            .split(',')
            .map(|v| strip_quotes(v).to_owned())
            .collect();
        if fields.len() < 5 {
            return Err(ModemError::DataFormat(format!(
                "short ECM status reply '{raw}'"
            )));
        }
        Ok(EcmConfig(fields))
    }

    /// Whether the data bridge is currently up.
    pub fn is_up(&mut self) -> Result<bool> {
        Ok(self.status()?.is_up())
    }

    /// Brings the bridge online. Sending start while already started is
    /// defined modem behavior, so no state check first.
    pub fn start(&mut self) -> Result<()> {
        info!("bringing ECM online");
        self.session.run_void("AT#ECM=1,0")
    }

    /// Takes the bridge offline. Same idempotence as [`Self::start`].
    pub fn stop(&mut self) -> Result<()> {
        info!("taking ECM offline");
        self.session.run_void("AT#ECMD=0")
    }

    /// Queries the USB personality value.
    pub fn usb_config(&mut self) -> Result<u32> {
        let text = self.session.run("AT#USBCFG?", &USBCFG_RE)?;
        text.parse().map_err(|_| {
            ModemError::DataFormat(format!("bad USBCFG value '{text}'"))
        })
    }
}

impl EcmController<'_> {
    /// Writes the USB personality. The modem always self-resets to apply
    /// this, so the reboot/resync sequence runs immediately after the write
    /// is acknowledged.
    pub fn apply_usb_config(&mut self, value: u32) -> Result<()> {
        self.session.run_void(&format!("AT#USBCFG={value}"))?;
        self.session.resync_after_reset()
    }

    /// Reboots the modem and resynchronizes. The reboot command itself gets
    /// no terminator; the channel dies under it.
    pub fn reboot(&mut self) -> Result<()> {
        self.session.send_unchecked("AT#REBOOT")?;
        self.session.resync_after_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fields: &[&str]) -> EcmConfig {
        EcmConfig(fields.iter().map(|f| f.to_string()).collect())
    }

    #[test]
    fn is_up_requires_the_literal_one() {
        assert!(config(&["0", "1", "x", "y", "z"]).is_up());
        assert!(!config(&["0", "0", "x", "y", "z"]).is_up());
        assert!(!config(&["0", "", "x", "y", "z"]).is_up());
        assert!(!config(&["0", "10", "x", "y", "z"]).is_up());
        assert!(!config(&["1"]).is_up());
    }
}
