//! Custom error types for the application.
//!
//! This module defines the error types used across the crate. Using the `thiserror`
//! crate, it provides a consistent way to report failures from configuration loading,
//! serial connection lifecycle misuse, and transport-level receive problems.
//!
//! ## Error Hierarchy
//!
//! - **`SorterError`**: application-level errors. Wraps configuration errors from
//!   `figment`, semantic validation failures, I/O and lookup-table parse failures, and
//!   connection errors, so callers can use `?` throughout.
//! - **`ConnectionError`**: lifecycle errors reported synchronously by
//!   [`SerialConnection`](crate::connection::SerialConnection) operations.
//! - **`ReceiveError`**: errors the transport reports for a specific connection. These
//!   are never returned from a call; they are delivered through the connection's error
//!   event and do not change the connection state.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SorterError>;

/// Convenience alias for results of connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum SorterError {
    /// Configuration could not be loaded or extracted
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or device I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup table JSON could not be parsed
    #[error("Lookup table error: {0}")]
    Lookup(#[from] serde_json::Error),

    /// A serial connection operation failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for SorterError {
    fn from(value: figment::Error) -> Self {
        SorterError::Config(Box::new(value))
    }
}

/// Errors returned by connection lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// `send` or `disconnect` was attempted before a successful `connect`.
    #[error("Serial connection is not connected")]
    NotConnected,

    /// The transport could not open the port.
    #[error("Failed to connect to '{path}': {reason}")]
    ConnectFailed {
        /// Port that failed to open
        path: String,
        /// Transport's description of the failure
        reason: String,
    },

    /// `connect` was called on an instance that already opened a port.
    #[error("Serial connection is {state} and cannot be reconnected; create a new connection")]
    NotReusable {
        /// Lifecycle state the connection is in
        state: &'static str,
    },

    /// The connection was disconnected and can no longer be written to.
    #[error("Serial connection is closed")]
    Closed,
}

/// Errors reported by the transport for a particular connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// The device closed the link
    #[error("Device disconnected")]
    Disconnected,

    /// The device went away, e.g. a USB adapter was unplugged
    #[error("Device lost")]
    DeviceLost,

    /// A break condition was seen on the line
    #[error("Break condition detected")]
    Break,

    /// A character arrived with a bad stop bit
    #[error("Framing error")]
    FrameError,

    /// The UART received data faster than it was read
    #[error("Hardware overrun")]
    Overrun,

    /// The driver's receive buffer filled up
    #[error("Receive buffer overflow")]
    BufferOverflow,

    /// A character arrived with bad parity
    #[error("Parity error")]
    ParityError,

    /// Any other OS-level read failure
    #[error("System error: {0}")]
    System(String),

    /// Raised by the line framer when an unterminated line exceeds the configured bound.
    #[error("Line exceeded {limit} bytes without a terminator; discarded {discarded} bytes")]
    LineTooLong {
        /// Configured maximum line length
        limit: usize,
        /// Bytes dropped from the runaway line
        discarded: usize,
    },
}

impl ReceiveError {
    /// Map an I/O error from a serial read onto the receive error taxonomy.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::NotFound => {
                ReceiveError::DeviceLost
            }
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionAborted => ReceiveError::Disconnected,
            _ => ReceiveError::System(err.to_string()),
        }
    }
}
