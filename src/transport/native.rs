//! Serial ports through the `serialport` crate.
//!
//! `serialport` is blocking, so opening, reading and writing run on Tokio's blocking
//! pool. Each open port gets a dedicated reader that publishes everything it reads to
//! the transport's [`Fanout`] until the port is disconnected or fails. Dropping the
//! transport stops every reader, so subscribers see their channel close.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ConnectionId, ConnectionInfo, Fanout, PortOptions, Transport, TransportEvent};
use crate::error::ReceiveError;

/// Internal read timeout; bounds how long a reader takes to notice a disconnect.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Size of a single read from the port.
const READ_CHUNK_BYTES: usize = 1024;

/// A serial port visible to the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    /// Path or name to open (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Bus and product description
    pub port_type: String,
}

struct OpenPort {
    path: String,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    stop: Arc<AtomicBool>,
}

/// Transport backed by operating-system serial ports.
#[derive(Default)]
pub struct NativeTransport {
    next_id: AtomicU32,
    ports: Mutex<HashMap<ConnectionId, OpenPort>>,
    fanout: Fanout,
}

impl NativeTransport {
    /// Create a transport with no open ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// List serial ports known to the operating system.
    pub fn available_ports() -> Result<Vec<PortSummary>> {
        let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

        Ok(ports
            .into_iter()
            .map(|port| {
                let port_type = match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => match usb.product {
                        Some(product) => format!("USB ({product})"),
                        None => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
                    },
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::Unknown => "Unknown".to_string(),
                };
                PortSummary {
                    port_name: port.port_name,
                    port_type,
                }
            })
            .collect())
    }

    /// Track an opened port and start its reader.
    fn register(
        &self,
        path: &str,
        baud_rate: u32,
        port: Box<dyn SerialPort>,
    ) -> Result<ConnectionInfo> {
        let reader = port
            .try_clone()
            .with_context(|| format!("Failed to clone handle for serial port '{}'", path))?;

        let connection_id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let stop = Arc::new(AtomicBool::new(false));

        self.ports.lock().insert(
            connection_id,
            OpenPort {
                path: path.to_string(),
                writer: Arc::new(Mutex::new(port)),
                stop: stop.clone(),
            },
        );

        let fanout = self.fanout.clone();
        tokio::task::spawn_blocking(move || read_loop(reader, connection_id, stop, fanout));

        info!(%connection_id, path, baud_rate, "Serial port opened");

        Ok(ConnectionInfo {
            connection_id,
            path: path.to_string(),
            baud_rate,
        })
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        for (connection_id, port) in self.ports.get_mut().drain() {
            port.stop.store(true, Ordering::SeqCst);
            debug!(%connection_id, path = %port.path, "Serial port released with transport");
        }
    }
}

#[async_trait]
impl Transport for NativeTransport {
    async fn connect(&self, path: &str, options: &PortOptions) -> Result<ConnectionInfo> {
        let path_owned = path.to_string();
        let baud_rate = options.baud_rate;

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path_owned, baud_rate)
                .timeout(READ_POLL_TIMEOUT)
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        path_owned, baud_rate
                    )
                })
        })
        .await
        .context("Serial open task panicked")??;

        self.register(path, baud_rate, port)
    }

    fn send(&self, connection_id: ConnectionId, data: Vec<u8>) {
        let Some(writer) = self
            .ports
            .lock()
            .get(&connection_id)
            .map(|port| port.writer.clone())
        else {
            warn!(%connection_id, "Dropping write for unknown serial connection");
            return;
        };

        tokio::task::spawn_blocking(move || {
            let mut port = writer.lock();
            let result = port.write_all(&data).and_then(|_| port.flush());
            match result {
                Ok(()) => trace!(%connection_id, bytes = data.len(), "Serial write complete"),
                Err(e) => warn!(%connection_id, error = %e, "Serial write failed"),
            }
        });
    }

    fn disconnect(&self, connection_id: ConnectionId) {
        match self.ports.lock().remove(&connection_id) {
            Some(port) => {
                port.stop.store(true, Ordering::SeqCst);
                info!(%connection_id, path = %port.path, "Serial port closed");
            }
            None => debug!(%connection_id, "Disconnect for unknown serial connection"),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.fanout.subscribe()
    }

    fn info(&self) -> String {
        format!("NativeTransport ({} open)", self.ports.lock().len())
    }
}

/// Blocking reader for one port. Exits on disconnect or on the first hard error.
fn read_loop(
    mut port: Box<dyn SerialPort>,
    connection_id: ConnectionId,
    stop: Arc<AtomicBool>,
    fanout: Fanout,
) {
    let mut buffer = [0u8; READ_CHUNK_BYTES];

    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut buffer) {
            Ok(0) => continue,
            Ok(n) => fanout.publish(TransportEvent::Receive {
                connection_id,
                data: buffer[..n].to_vec(),
            }),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                continue
            }
            Err(e) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!(%connection_id, error = %e, "Serial read failed");
                    fanout.publish(TransportEvent::ReceiveError {
                        connection_id,
                        error: ReceiveError::from_io(&e),
                    });
                }
                break;
            }
        }
    }

    debug!(%connection_id, "Serial reader stopped");
}
