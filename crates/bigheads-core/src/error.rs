//! Error types for the BigHeads core.
//!
//! Inbound-pipeline errors never escape the dispatcher; they become counter
//! increments. Outbound API errors are returned to the caller. Startup errors
//! carry enough shape for the binary to map them onto exit codes.

use thiserror::Error;

/// Core error type for BigHeads operations.
#[derive(Error, Debug)]
pub enum Error {
    /// BLE-level failure. Recoverable by retry; the affected peer is marked
    /// disconnected.
    #[error("transport error: {0}")]
    Transport(String),

    /// No usable Bluetooth adapter on this host.
    #[error("no BLE adapter available")]
    NoAdapter,

    /// The peer is not currently connected.
    #[error("peer not connected")]
    NotConnected,

    /// Malformed envelope or frame. Dropped silently.
    #[error("codec error: {0}")]
    Codec(String),

    /// Decrypt or authentication failure. Dropped, logged at debug.
    /// Details are intentionally vague to avoid oracle behavior.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Pairwise handshake gave up after retransmits. Surfaced to the UI.
    #[error("handshake with peer failed")]
    Handshake(String),

    /// Storage operation failed. Fatal for seen-cache writes, otherwise
    /// logged and continued.
    #[error("storage error: {0}")]
    Storage(String),

    /// Envelope violates a protocol invariant (e.g. oversized TTL).
    /// Dropped, logged at warn.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Bad configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Payload exceeds the inline file cap.
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured cap.
        limit: usize,
    },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using the BigHeads [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the inbound pipeline should drop silently (no warn-level log).
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Codec(_) | Error::Crypto(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
