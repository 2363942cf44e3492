//! Line-oriented serial connection.
//!
//! A [`SerialConnection`] owns the lifecycle of one port opened through a
//! [`Transport`], frames everything received on it into newline-terminated lines, and
//! exposes three event streams:
//!
//! - **connect**: fired once, when the port opens
//! - **line**: fired once per complete line, terminator included
//! - **error**: fired for each receive error the transport reports for this port
//!
//! Listeners run synchronously, in registration order, inside the call that produced the
//! event. A receipt is always fully drained before control returns, so the framer's
//! residual never holds a newline between events.
//!
//! # Lifecycle
//!
//! ```text
//! Unset ──connect ok──▶ Open ──disconnect──▶ Closed
//!   │                    │
//!   └─connect failed     └─receive error (event only, state unchanged)
//! ```
//!
//! `Closed` is terminal; reconnecting means creating a new `SerialConnection`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::error::{ConnectionError, ConnectionResult, ReceiveError};
use crate::events::Subject;
use crate::framing::LineFramer;
use crate::transport::{ConnectionId, PortOptions, Transport, TransportEvent};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never opened
    Unset,
    /// Open and receiving
    Open(ConnectionId),
    /// Disconnected; terminal
    Closed(ConnectionId),
}

impl ConnectionState {
    /// Short lowercase name for messages.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Unset => "unset",
            ConnectionState::Open(_) => "open",
            ConnectionState::Closed(_) => "closed",
        }
    }
}

/// One serial device, framed into lines.
pub struct SerialConnection {
    /// Name used in logs (e.g., "caliper")
    name: String,
    transport: Arc<dyn Transport>,
    state: ConnectionState,
    framer: LineFramer,
    /// Shared transport events; present only while open
    inbox: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    on_connect: Subject<()>,
    on_line: Subject<str>,
    on_error: Subject<ReceiveError>,
}

impl SerialConnection {
    /// Create an unopened connection on `transport`.
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            state: ConnectionState::Unset,
            framer: LineFramer::new(),
            inbox: None,
            on_connect: Subject::new(),
            on_line: Subject::new(),
            on_error: Subject::new(),
        }
    }

    /// Bound unterminated input to `limit` bytes (see [`LineFramer::with_max_line_bytes`]).
    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.framer = self.framer.with_max_line_bytes(limit);
        self
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transport id, once the port has been opened.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self.state {
            ConnectionState::Unset => None,
            ConnectionState::Open(id) | ConnectionState::Closed(id) => Some(id),
        }
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open(_))
    }

    /// Received text not yet terminated by a newline.
    pub fn residual(&self) -> &str {
        self.framer.residual()
    }

    /// Register a listener for the connect event.
    pub fn on_connect<F>(&mut self, mut listener: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_connect.subscribe(move |_: &()| listener());
    }

    /// Register a listener for received lines.
    pub fn on_line<F>(&mut self, listener: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_line.subscribe(listener);
    }

    /// Register a listener for receive errors.
    pub fn on_error<F>(&mut self, listener: F)
    where
        F: FnMut(&ReceiveError) + Send + 'static,
    {
        self.on_error.subscribe(listener);
    }

    /// Open `path`.
    ///
    /// On success the connection becomes [`ConnectionState::Open`] and the connect event
    /// fires. On failure no event fires and the state stays [`ConnectionState::Unset`].
    pub async fn connect(&mut self, path: &str, options: &PortOptions) -> ConnectionResult<ConnectionId> {
        if self.state != ConnectionState::Unset {
            return Err(ConnectionError::NotReusable {
                state: self.state.name(),
            });
        }

        // Subscribe first so nothing read between open and registration is lost
        let inbox = self.transport.subscribe();

        let info = match self.transport.connect(path, options).await {
            Ok(info) => info,
            Err(e) => {
                warn!(connection = %self.name, path, error = %e, "Connection failed");
                return Err(ConnectionError::ConnectFailed {
                    path: path.to_string(),
                    reason: format!("{e:#}"),
                });
            }
        };

        self.state = ConnectionState::Open(info.connection_id);
        self.inbox = Some(inbox);
        info!(
            connection = %self.name,
            connection_id = %info.connection_id,
            path = %info.path,
            baud_rate = info.baud_rate,
            "Connected"
        );

        self.on_connect.dispatch(&());
        Ok(info.connection_id)
    }

    /// Route one transport event. Events for other connections are ignored.
    pub fn handle_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::Receive {
                connection_id,
                data,
            } => self.handle_receive(*connection_id, data),
            TransportEvent::ReceiveError {
                connection_id,
                error,
            } => self.handle_receive_error(*connection_id, error),
        }
    }

    /// Frame a received chunk and fire the line event for every complete line.
    pub fn handle_receive(&mut self, connection_id: ConnectionId, data: &[u8]) {
        if self.state != ConnectionState::Open(connection_id) {
            return;
        }

        let mut lines = self.framer.feed(data);
        let discarded = lines.discarded();

        for line in lines.by_ref() {
            trace!(connection = %self.name, line = %line.escape_default(), "Read line");
            self.on_line.dispatch(line.as_str());
        }

        if discarded > 0 {
            let limit = self.framer.max_line_bytes().unwrap_or_default();
            let error = ReceiveError::LineTooLong { limit, discarded };
            warn!(connection = %self.name, %error, "Discarded unterminated input");
            self.on_error.dispatch(&error);
        }
    }

    /// Fire the error event for a receive error on this connection.
    ///
    /// The connection stays open; callers decide whether to disconnect.
    pub fn handle_receive_error(&mut self, connection_id: ConnectionId, error: &ReceiveError) {
        if self.state != ConnectionState::Open(connection_id) {
            return;
        }

        warn!(connection = %self.name, %connection_id, %error, "Receive error");
        self.on_error.dispatch(error);
    }

    /// Wait for the next transport event and handle it.
    ///
    /// Returns `true` when the event belonged to this connection. Never completes while
    /// the connection is not open, so it can sit in a `select!` unconditionally.
    pub async fn process_next(&mut self) -> bool {
        let Some(inbox) = self.inbox.as_mut() else {
            return std::future::pending().await;
        };

        let next = inbox.recv().await;
        match next {
            Some(event) => {
                let ours = self.state == ConnectionState::Open(event.connection_id());
                self.handle_event(&event);
                ours
            }
            None => {
                debug!(connection = %self.name, "Transport event stream ended");
                self.inbox = None;
                false
            }
        }
    }

    /// Encode `message` and hand it to the transport.
    pub fn send(&self, message: &str) -> ConnectionResult<()> {
        let connection_id = match self.state {
            ConnectionState::Unset => return Err(ConnectionError::NotConnected),
            ConnectionState::Closed(_) => return Err(ConnectionError::Closed),
            ConnectionState::Open(id) => id,
        };

        debug!(connection = %self.name, message = %message.escape_default(), "Sending");
        self.transport.send(connection_id, codec::encode(message));
        Ok(())
    }

    /// Close the port. No further events are dispatched afterwards.
    pub fn disconnect(&mut self) -> ConnectionResult<()> {
        let connection_id = match self.state {
            ConnectionState::Unset => return Err(ConnectionError::NotConnected),
            ConnectionState::Closed(_) => return Err(ConnectionError::Closed),
            ConnectionState::Open(id) => id,
        };

        self.transport.disconnect(connection_id);
        self.state = ConnectionState::Closed(connection_id);
        self.inbox = None;
        info!(connection = %self.name, %connection_id, "Disconnected");
        Ok(())
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("transport", &self.transport.info())
            .finish()
    }
}
