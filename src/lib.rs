//! # Drill Sorter Core Library
//!
//! Host-side controller for a drill-bit sorting cell. A digital caliper streams readings
//! over one serial link and a pick-and-place robot talks over a second one; when the robot
//! reports a bit in the jaws, the host waits for the reading to settle, classifies it, and
//! tells the robot which cup to use.
//!
//! ## Crate Structure
//!
//! - **`codec`**: UTF-8 conversion between serial bytes and text.
//! - **`framing`**: `LineFramer`, which turns arbitrarily chunked input into
//!   newline-terminated lines.
//! - **`events`**: `Subject<T>`, an ordered list of listeners for one event kind.
//! - **`transport`**: the `Transport` boundary with a native serial implementation and an
//!   in-memory mock.
//! - **`connection`**: `SerialConnection`, the lifecycle of one port with connect, line and
//!   error events.
//! - **`poller`**: `wait_for`, a bounded re-evaluation loop on the Tokio timer.
//! - **`classify`**: the `Classifier` trait and the nearest-key `LookupTable`.
//! - **`measurement`**: caliper readings, zero offset and delta, shared between tasks.
//! - **`capture`**: the sentinel-triggered capture sequence and the cup table.
//! - **`app`**: `SorterApp`, which wires everything together, and console commands.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the crate's error types.

pub mod app;
pub mod capture;
pub mod classify;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod framing;
pub mod logging;
pub mod measurement;
pub mod poller;
pub mod transport;
