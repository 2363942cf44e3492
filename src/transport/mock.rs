//! Mock transport for testing
//!
//! This transport implements the [`Transport`] trait without physical hardware. It
//! provides:
//! - Injection of received bytes and receive errors for any open connection
//! - Controllable connect failure, once or for a given path
//! - A record of everything written, per connection
//! - Call logging for test verification

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ConnectionId, ConnectionInfo, Fanout, PortOptions, Transport, TransportEvent};
use crate::error::ReceiveError;

/// In-memory transport
///
/// # Example
///
/// ```
/// use drill_sorter::transport::{MockTransport, PortOptions, Transport};
///
/// # tokio_test::block_on(async {
/// let transport = MockTransport::new();
/// let info = transport.connect("/dev/mock0", &PortOptions::default()).await.unwrap();
/// transport.send(info.connection_id, b"%01\n".to_vec());
/// assert_eq!(transport.sent_text(info.connection_id), vec!["%01\n".to_string()]);
/// # })
/// ```
#[derive(Debug, Default)]
pub struct MockTransport {
    next_id: AtomicU32,
    open: Mutex<BTreeSet<ConnectionId>>,
    should_fail_next: AtomicBool,
    failing_paths: Mutex<BTreeSet<String>>,
    sent: Mutex<BTreeMap<ConnectionId, Vec<Vec<u8>>>>,
    call_log: Mutex<Vec<String>>,
    fanout: Fanout,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` fail
    pub fn trigger_connect_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Make every `connect` to `path` fail
    pub fn trigger_connect_failure_for(&self, path: &str) {
        self.failing_paths.lock().insert(path.to_string());
    }

    /// Deliver bytes as if read from the device behind `connection_id`
    pub fn inject_bytes(&self, connection_id: ConnectionId, data: &[u8]) {
        self.log_call(format!("inject_bytes {connection_id}"));
        self.fanout.publish(TransportEvent::Receive {
            connection_id,
            data: data.to_vec(),
        });
    }

    /// Deliver a receive error for `connection_id`
    pub fn inject_error(&self, connection_id: ConnectionId, error: ReceiveError) {
        self.log_call(format!("inject_error {connection_id}"));
        self.fanout.publish(TransportEvent::ReceiveError {
            connection_id,
            error,
        });
    }

    /// Raw writes made to `connection_id`, in order
    pub fn sent(&self, connection_id: ConnectionId) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Writes made to `connection_id`, decoded as text
    pub fn sent_text(&self, connection_id: ConnectionId) -> Vec<String> {
        self.sent(connection_id)
            .iter()
            .map(|bytes| crate::codec::decode(bytes))
            .collect()
    }

    /// Whether `connection_id` is currently open
    pub fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.open.lock().contains(&connection_id)
    }

    /// Get a copy of the call log for verification
    pub fn get_call_log(&self) -> Vec<String> {
        self.call_log.lock().clone()
    }

    /// Clear the call log
    pub fn clear_call_log(&self) {
        self.call_log.lock().clear();
    }

    fn log_call(&self, entry: String) {
        self.call_log.lock().push(entry);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, path: &str, options: &PortOptions) -> Result<ConnectionInfo> {
        self.log_call(format!("connect {path} @ {}", options.baud_rate));

        if self.should_fail_next.swap(false, Ordering::SeqCst)
            || self.failing_paths.lock().contains(path)
        {
            return Err(anyhow!("Mock connection failure"));
        }

        let connection_id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.open.lock().insert(connection_id);
        debug!(%connection_id, path, "MockTransport opened port");

        Ok(ConnectionInfo {
            connection_id,
            path: path.to_string(),
            baud_rate: options.baud_rate,
        })
    }

    fn send(&self, connection_id: ConnectionId, data: Vec<u8>) {
        self.log_call(format!("send {connection_id}"));
        self.sent.lock().entry(connection_id).or_default().push(data);
    }

    fn disconnect(&self, connection_id: ConnectionId) {
        self.log_call(format!("disconnect {connection_id}"));
        self.open.lock().remove(&connection_id);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.fanout.subscribe()
    }

    fn info(&self) -> String {
        format!("MockTransport ({} open)", self.open.lock().len())
    }
}
