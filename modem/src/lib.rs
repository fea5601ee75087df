//! AT-command automation for the Telit LE910 cellular module.
//!
//! The core is the request/response automaton in [`session`]: send a
//! command, wait for a terminator (`OK`, `ERROR`, a data pattern, or the
//! window expiring), classify the outcome, and expose typed operations on
//! top. [`gps`] and [`ecm`] are independent consumers of that engine; they
//! share nothing but the session they borrow.
//!
//! ```no_run
//! use std::time::Duration;
//! use telit_modem::{GpsReceiver, Session};
//!
//! # fn main() -> telit_modem::Result<()> {
//! let mut session =
//!     Session::open("/dev/ttyUSB3", 115_200, Duration::from_secs(10))?;
//! session.handshake(10)?;
//! let mut gps = GpsReceiver::new(&mut session);
//! gps.set_power(true)?;
//! if let Some(fix) = gps.acquire(2.0, 30)? {
//!     println!("{:.4},{:.4}", fix.latitude, fix.longitude);
//! }
//! gps.set_power(false)?;
//! # Ok(())
//! # }
//! ```

pub mod ecm;
pub mod error;
pub mod gps;
pub mod probe;
pub mod serial;
pub mod session;

pub use ecm::{ApnContext, EcmConfig, EcmController};
pub use error::{ModemError, Result};
pub use gps::{decode_position, GpsFix, GpsReceiver};
pub use session::{
    CommandOutcome, Liveness, Session, DEFAULT_BAUD, DEFAULT_TIMEOUT,
};
