//! Serial transport boundary.
//!
//! A [`Transport`] opens, writes to and closes serial devices. Everything it reads is
//! published as a [`TransportEvent`] tagged with the [`ConnectionId`] it belongs to, and
//! every subscriber receives every event: filtering by id is the subscriber's job.
//!
//! Two implementations are provided:
//! - [`native::NativeTransport`] - real serial ports through the `serialport` crate
//!   (requires the `instrument_serial` feature)
//! - [`mock::MockTransport`] - in-memory transport for tests

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ReceiveError;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod native;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use native::NativeTransport;

/// Opaque handle the transport assigns to an open port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Wrap a raw transport id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw transport id.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Options passed through to the transport when a port is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptions {
    /// Communication speed (e.g., 38400, 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

impl PortOptions {
    /// Options for the given baud rate.
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
        }
    }
}

/// Details of a successfully opened port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Id assigned by the transport
    pub connection_id: ConnectionId,
    /// Port that was opened
    pub path: String,
    /// Baud rate the port was opened at
    pub baud_rate: u32,
}

/// Something the transport observed on an open port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes read from the port
    Receive {
        /// Port the bytes came from
        connection_id: ConnectionId,
        /// Bytes as read
        data: Vec<u8>,
    },
    /// The port reported an error
    ReceiveError {
        /// Port that failed
        connection_id: ConnectionId,
        /// What went wrong
        error: ReceiveError,
    },
}

impl TransportEvent {
    /// The connection this event belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            TransportEvent::Receive { connection_id, .. }
            | TransportEvent::ReceiveError { connection_id, .. } => *connection_id,
        }
    }
}

/// Serial device access used by [`SerialConnection`](crate::connection::SerialConnection).
///
/// `send` and `disconnect` are fire-and-forget: they queue the work and return
/// immediately, and failures are only logged.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `path` with `options`.
    async fn connect(&self, path: &str, options: &PortOptions) -> Result<ConnectionInfo>;

    /// Queue `data` for writing on `connection_id`.
    fn send(&self, connection_id: ConnectionId, data: Vec<u8>);

    /// Request that `connection_id` be closed.
    fn disconnect(&self, connection_id: ConnectionId);

    /// Subscribe to events for every connection of this transport.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Short description for logs.
    fn info(&self) -> String;
}

/// Fan-out of transport events to every live subscriber.
///
/// Unbounded channels keep delivery lossless and ordered per subscriber; closed
/// subscribers are pruned on the next publish.
#[derive(Clone, Default)]
pub struct Fanout {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>>,
}

impl Fanout {
    /// Create a fan-out with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&self, event: TransportEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl fmt::Debug for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
