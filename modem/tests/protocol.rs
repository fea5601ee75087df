//! Drives the command engine, GPS loop, and ECM controller against a
//! scripted in-memory port, checking the automaton's outcomes without any
//! hardware on the line.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use telit_modem::serial::Channel;
use telit_modem::{
    EcmController, GpsReceiver, Liveness, ModemError, Session,
};

#[derive(Default)]
struct Inner {
    /// Each entry pairs a command line the engine is expected to send with
    /// the chunks the modem answers. An empty answer models a hung modem.
    script: VecDeque<(String, Vec<String>)>,
    pending: VecDeque<Vec<u8>>,
    written: Vec<String>,
    line: String,
    /// When true, reads report EOF once the script is exhausted, modeling
    /// the device node dying across a reset.
    eof_when_idle: bool,
}

#[derive(Clone)]
struct MockPort(Arc<Mutex<Inner>>);

impl MockPort {
    fn scripted(script: &[(&str, &[&str])]) -> Self {
        let inner = Inner {
            script: script
                .iter()
                .map(|(cmd, answers)| {
                    (
                        cmd.to_string(),
                        answers.iter().map(|a| a.to_string()).collect(),
                    )
                })
                .collect(),
            ..Inner::default()
        };
        Self(Arc::new(Mutex::new(inner)))
    }

    fn with_eof_when_idle(self) -> Self {
        self.0.lock().unwrap().eof_when_idle = true;
        self
    }

    fn sent_commands(&self) -> Vec<String> {
        self.0.lock().unwrap().written.clone()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        match inner.pending.pop_front() {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None if inner.eof_when_idle && inner.script.is_empty() => Ok(0),
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        for &byte in buf {
            if byte == b'\r' {
                let cmd = std::mem::take(&mut inner.line);
                if inner
                    .script
                    .front()
                    .is_some_and(|(expected, _)| *expected == cmd)
                {
                    let (_, answers) = inner.script.pop_front().unwrap();
                    for answer in answers {
                        inner.pending.push_back(answer.into_bytes());
                    }
                }
                inner.written.push(cmd);
            } else {
                inner.line.push(byte as char);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn session_over(port: MockPort) -> Session<MockPort> {
    let mut session =
        Session::with_channel(Channel::from_port(port), Duration::from_millis(100));
    session.set_recovery_timing(
        Duration::from_millis(1),
        Duration::ZERO,
        Duration::from_millis(50),
    );
    session
}

fn gps_sentence(hdop: &str) -> String {
    format!(
        "\r\n$GPSACP: 122330.000,3723.2475N,12202.2843W,{hdop},18.1,3,0.0,0.0,0.0,090821,09,04\r\n\r\nOK\r\n"
    )
}

const NO_FIX: &str = "\r\n$GPSACP: ,,,,,1,,,,,,\r\n\r\nOK\r\n";

#[test]
fn handshake_succeeds_once_the_modem_wakes_up() {
    let port = MockPort::scripted(&[
        ("AT", &[]), // still booting, no answer
        ("AT", &[]),
        ("AT", &["AT\r\nOK\r\n"]),
    ]);
    let mut session = session_over(port.clone());

    session.handshake(5).unwrap();

    assert_eq!(session.liveness(), Liveness::Open);
    let probes = port
        .sent_commands()
        .iter()
        .filter(|c| *c == "AT")
        .count();
    assert_eq!(probes, 3);
}

#[test]
fn handshake_exhaustion_is_a_timeout() {
    let port = MockPort::scripted(&[("AT", &[]), ("AT", &[]), ("AT", &[])]);
    let mut session = session_over(port);

    let err = session.handshake(3).unwrap_err();

    assert!(matches!(err, ModemError::Timeout));
}

#[test]
fn run_returns_the_captured_payload() {
    let port = MockPort::scripted(&[(
        "AT+ICCID",
        &["\r\n+ICCID: 8988303000001234\r\n\r\nOK\r\n"],
    )]);
    let mut session = session_over(port);

    assert_eq!(session.iccid().unwrap(), 8988303000001234);
}

#[test]
fn imei_drops_the_software_version_digits() {
    let port = MockPort::scripted(&[(
        "AT+IMEISV",
        &["\r\n+IMEISV: 3531650800467232\r\n\r\nOK\r\n"],
    )]);
    let mut session = session_over(port);

    assert_eq!(session.imei().unwrap(), 35316508004672);
}

#[test]
fn terminator_before_data_is_a_protocol_error() {
    let port = MockPort::scripted(&[("AT+ICCID", &["\r\nOK\r\n"])]);
    let mut session = session_over(port);

    let err = session.iccid().unwrap_err();

    assert!(matches!(err, ModemError::Protocol(_)));
}

#[test]
fn error_terminator_surfaces_as_protocol_error() {
    let port = MockPort::scripted(&[("AT$GPSP=1", &["\r\nERROR\r\n"])]);
    let mut session = session_over(port);

    let err = GpsReceiver::new(&mut session).set_power(true).unwrap_err();

    assert!(matches!(err, ModemError::Protocol(_)));
}

#[test]
fn acquire_stops_at_the_target_without_burning_attempts() {
    let port = MockPort::scripted(&[
        ("AT$GPSACP", &[gps_sentence("9.0").as_str()]),
        ("AT$GPSACP", &[gps_sentence("4.0").as_str()]),
        ("AT$GPSACP", &[gps_sentence("2.0").as_str()]),
        ("AT$GPSACP", &[gps_sentence("1.2").as_str()]),
        ("AT$GPSACP", &[NO_FIX]),
    ]);
    let mut session = session_over(port.clone());

    let fix = GpsReceiver::new(&mut session)
        .with_delays(Duration::ZERO, Duration::ZERO)
        .acquire(1.5, 5)
        .unwrap()
        .expect("a fix met the target");

    assert!((fix.hdop - 1.2).abs() < 1e-9);
    let polls = port
        .sent_commands()
        .iter()
        .filter(|c| *c == "AT$GPSACP")
        .count();
    assert_eq!(polls, 4, "the fifth attempt must never run");
}

#[test]
fn acquire_returns_none_when_nothing_usable_was_seen() {
    let port = MockPort::scripted(&[
        ("AT$GPSACP", &[NO_FIX]),
        ("AT$GPSACP", &[NO_FIX]),
        ("AT$GPSACP", &[]), // hang: timeout counts as a miss too
    ]);
    let mut session = session_over(port);

    let fix = GpsReceiver::new(&mut session)
        .with_delays(Duration::ZERO, Duration::ZERO)
        .acquire(1.5, 3)
        .unwrap();

    assert_eq!(fix, None);
}

#[test]
fn acquire_never_regresses_to_none_after_a_usable_fix() {
    let port = MockPort::scripted(&[
        ("AT$GPSACP", &[gps_sentence("4.0").as_str()]),
        ("AT$GPSACP", &[NO_FIX]),
        ("AT$GPSACP", &[NO_FIX]),
    ]);
    let mut session = session_over(port);

    let fix = GpsReceiver::new(&mut session)
        .with_delays(Duration::ZERO, Duration::ZERO)
        .acquire(1.5, 3)
        .unwrap()
        .expect("the above-target fix is retained");

    assert!((fix.hdop - 4.0).abs() < 1e-9);
}

#[test]
fn continuous_acquisition_outlasts_a_single_batch() {
    // The open-ended loop must keep polling across batch boundaries until
    // a fix meets the target, not give up at the per-batch cap.
    let good = gps_sentence("1.0");
    let miss: [&str; 1] = [NO_FIX];
    let hit: [&str; 1] = [good.as_str()];
    let mut script: Vec<(&str, &[&str])> = vec![("AT$GPSACP", &miss); 13];
    script.push(("AT$GPSACP", &hit));
    let port = MockPort::scripted(&script);
    let mut session = session_over(port.clone());

    let mut published = Vec::new();
    let fix = GpsReceiver::new(&mut session)
        .with_delays(Duration::ZERO, Duration::ZERO)
        .acquire_until(1.5, |f| published.push(f.hdop))
        .unwrap();

    assert!((fix.hdop - 1.0).abs() < 1e-9);
    assert_eq!(published, vec![1.0]);
    let polls = port
        .sent_commands()
        .iter()
        .filter(|c| *c == "AT$GPSACP")
        .count();
    assert_eq!(polls, 14);
}

#[test]
fn a_power_managed_poll_cycle_leaves_gps_off() {
    let port = MockPort::scripted(&[
        ("AT$GPSP?", &["\r\n$GPSP: 0\r\n\r\nOK\r\n"]),
        ("AT$GPSP=1", &["\r\nOK\r\n"]),
        ("AT$GPSACP", &[gps_sentence("1.2").as_str()]),
        ("AT$GPSP=0", &["\r\nOK\r\n"]),
    ]);
    let mut session = session_over(port.clone());

    let mut receiver = GpsReceiver::new(&mut session)
        .with_delays(Duration::ZERO, Duration::ZERO);
    assert!(!receiver.power().unwrap());
    receiver.set_power(true).unwrap();
    let fix = receiver.acquire(1.5, 2).unwrap().expect("first poll fixes");
    receiver.set_power(false).unwrap();

    assert!((fix.hdop - 1.2).abs() < 1e-9);
    assert_eq!(
        port.sent_commands().last().map(String::as_str),
        Some("AT$GPSP=0")
    );
}

#[test]
fn read_context_keeps_only_the_managed_row() {
    let port = MockPort::scripted(&[(
        "AT+CGDCONT?",
        &[
            "\r\n+CGDCONT: 2,\"IPV6\",\"other\",\"\",0,0\r\n\
             +CGDCONT: 1,\"IP\",\"super\",\"\",0,0\r\n\r\nOK\r\n",
        ],
    )]);
    let mut session = session_over(port);

    let ctx = EcmController::new(&mut session).read_context().unwrap();

    assert_eq!(ctx.ip_type, "IP");
    assert_eq!(ctx.apn, "super");
}

#[test]
fn read_context_without_the_managed_row_is_a_data_format_error() {
    let port = MockPort::scripted(&[(
        "AT+CGDCONT?",
        &["\r\n+CGDCONT: 2,\"IPV6\",\"other\",\"\",0,0\r\n\r\nOK\r\n"],
    )]);
    let mut session = session_over(port);

    let err = EcmController::new(&mut session).read_context().unwrap_err();

    assert!(matches!(err, ModemError::DataFormat(_)));
}

#[test]
fn ecm_status_reports_up() {
    let port = MockPort::scripted(&[(
        "AT#ECMC?",
        &["\r\n#ECMC: 0,1,\"usb0\",\"192.168.15.2\",\"255.255.255.0\"\r\n\r\nOK\r\n"],
    )]);
    let mut session = session_over(port);

    assert!(EcmController::new(&mut session).is_up().unwrap());
}

#[test]
fn short_ecm_status_is_a_data_format_error() {
    let port = MockPort::scripted(&[(
        "AT#ECMC?",
        &["\r\n#ECMC: 0,1,2\r\n\r\nOK\r\n"],
    )]);
    let mut session = session_over(port);

    let err = EcmController::new(&mut session).status().unwrap_err();

    assert!(matches!(err, ModemError::DataFormat(_)));
}

#[test]
fn reboot_recovery_fails_hard_when_the_channel_never_dies() {
    // The port keeps timing out instead of reporting EOF: the old channel
    // never died, so recovery must stop before any re-handshake.
    let port = MockPort::scripted(&[]);
    let mut session = session_over(port.clone());

    let err = session.await_channel_death().unwrap_err();

    assert!(matches!(err, ModemError::Timeout));
    assert!(
        !port.sent_commands().iter().any(|c| c == "AT"),
        "no probe may be sent on an unconfirmed channel"
    );
}

#[test]
fn reboot_recovery_proceeds_once_eof_is_observed() {
    let port = MockPort::scripted(&[]).with_eof_when_idle();
    let mut session = session_over(port);

    session.await_channel_death().unwrap();
}

#[test]
fn commands_are_cr_terminated_with_no_line_noise() {
    let port = MockPort::scripted(&[("AT", &["AT\r\nOK\r\n"])]);
    let mut session = session_over(port.clone());

    session.handshake(1).unwrap();

    // The bare flush line precedes the probe.
    assert_eq!(port.sent_commands(), vec!["".to_string(), "AT".to_string()]);
}

#[test]
fn regexes_used_by_the_engine_anchor_on_crlf() {
    // A payload split across chunk boundaries must still match once the
    // terminating CRLF arrives.
    let port = MockPort::scripted(&[(
        "AT+CSQ",
        &["\r\n+CSQ: 2", "3,99\r\n", "\r\nOK\r\n"],
    )]);
    let mut session = session_over(port);

    let strength = session.signal_strength().unwrap();

    let expected = 23.0 / 31.0;
    assert!((strength.unwrap() - expected).abs() < 1e-9);
}

#[test]
fn position_pattern_stops_at_the_first_crlf() {
    // Guards the shape of the position pattern against accidental widening:
    // it must not swallow the terminating OK.
    let re = Regex::new(r"\$GPSACP:\s+([0-9A-Z,.]+)\r\n").unwrap();
    let caps = re
        .captures("\r\n$GPSACP: ,,,,,1,,,,,,\r\n\r\nOK\r\n")
        .unwrap();
    assert_eq!(&caps[1], ",,,,,1,,,,,,");
}
