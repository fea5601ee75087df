use thiserror::Error;

/// Everything that can go wrong while talking to the modem.
#[derive(Error, Debug)]
pub enum ModemError {
    /// No expected terminator arrived within the wait window. Recoverable by
    /// caller-level retry, except during post-reboot recovery where it is
    /// fatal to the session.
    #[error("timed out waiting for the modem")]
    Timeout,

    /// The modem answered `ERROR`, or terminated a command out of order.
    /// Never auto-retried by the engine; the caller decides.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A successful reply did not have the expected structural shape.
    /// A compatibility signal, never retried.
    #[error("malformed modem reply: {0}")]
    DataFormat(String),

    /// The serial channel could not be opened, or died under a command.
    #[error("serial channel unavailable: {0}")]
    TransportUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for functions in this crate.
pub type Result<T> = std::result::Result<T, ModemError>;
