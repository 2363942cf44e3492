//! The sorter application.
//!
//! [`SorterApp`] wires the caliper and robot connections to the shared measurement state
//! and the capture sequencer, then multiplexes everything on one task:
//!
//! - caliper lines are parsed, offset and classified into the [`SharedMeasurement`]
//! - robot sentinel lines start a settle wait
//! - finished waits record a capture and send the cup command to the robot
//! - [`ConsoleCommand`]s from the operator adjust the zero offset and inspect the table
//!
//! Console input is read by [`spawn_console`] on a plain thread, so a blocked read never
//! holds up runtime shutdown.

use std::fmt;
use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureSequencer, CaptureTable};
use crate::classify::Classifier;
use crate::config::SorterConfig;
use crate::connection::SerialConnection;
use crate::error::{AppResult, ReceiveError};
use crate::measurement::{
    format_millimetres, millimetres_to_hundredths, parse_reading, MeasurementState,
    SharedMeasurement,
};
use crate::poller::PollOutcome;
use crate::transport::Transport;

/// Operator commands accepted on the console.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Make the current caliper position read as this many millimetres
    Zero(f64),
    /// Forget all cup assignments
    Clear,
    /// Show the cup assignments
    Table,
    /// Show readings and connection states
    Status,
    /// Disconnect and stop
    Quit,
}

impl ConsoleCommand {
    /// Parse one console line. `zero` without an argument zeroes at 0 mm.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("Empty command".to_string());
        };

        let command = match verb.to_lowercase().as_str() {
            "zero" => {
                let millimetres = match words.next() {
                    Some(value) => value
                        .parse::<f64>()
                        .ok()
                        .filter(|mm| mm.is_finite())
                        .ok_or_else(|| format!("Invalid zero value '{value}'"))?,
                    None => 0.0,
                };
                ConsoleCommand::Zero(millimetres)
            }
            "clear" => ConsoleCommand::Clear,
            "table" => ConsoleCommand::Table,
            "status" => ConsoleCommand::Status,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => {
                return Err(format!(
                    "Unknown command '{other}'. Try: zero <mm>, clear, table, status, quit"
                ))
            }
        };

        if let Some(extra) = words.next() {
            return Err(format!("Unexpected argument '{extra}'"));
        }

        Ok(command)
    }
}

/// Forward console lines from `input` to the application on a dedicated thread.
///
/// Blank lines are skipped and lines that do not parse are reported on stderr. The
/// thread ends when input runs out or nobody receives commands any more.
pub fn spawn_console<R>(
    input: R,
    commands: mpsc::UnboundedSender<ConsoleCommand>,
) -> std::io::Result<thread::JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(error = %e, "Console input failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ConsoleCommand::parse(&line) {
                    Ok(command) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Err(message) => eprintln!("{message}"),
                }
            }
            debug!("Console reader stopped");
        })
}

/// Caliper and robot, wired together.
pub struct SorterApp {
    config: SorterConfig,
    caliper: SerialConnection,
    robot: SerialConnection,
    measurement: SharedMeasurement,
    sequencer: CaptureSequencer,
    /// Settle wait started by the robot listener, kept so shutdown can abort it
    pending_wait: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SorterApp {
    /// Build the application and register its listeners. Nothing is opened yet.
    pub fn new(
        config: &SorterConfig,
        transport: Arc<dyn Transport>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let measurement = MeasurementState::shared();
        let sequencer = CaptureSequencer::new(config.capture.settings(), measurement.clone());
        let pending_wait: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let mut caliper = SerialConnection::new("caliper", transport.clone());
        let mut robot = SerialConnection::new("robot", transport);
        if let Some(limit) = config.framing.max_line_bytes {
            caliper = caliper.with_max_line_bytes(limit);
            robot = robot.with_max_line_bytes(limit);
        }

        caliper.on_connect(|| info!("Caliper ready; waiting for readings"));
        let state = measurement.clone();
        caliper.on_line(move |line| {
            let Some(raw) = parse_reading(line) else {
                debug!(line = %line.escape_default(), "Ignoring non-numeric caliper line");
                return;
            };
            let mut state = state.lock();
            if let Some(published) = state.record_classified(raw, classifier.as_ref()) {
                trace!(
                    raw,
                    reading = %format_millimetres(published),
                    label = state.classification().map(|c| c.label.as_str()),
                    "Caliper reading"
                );
            }
        });
        caliper.on_error(|error| report_device_error("caliper", error));

        robot.on_connect(|| info!("Robot ready; waiting for capture requests"));
        let trigger = sequencer.trigger();
        let waits = pending_wait.clone();
        robot.on_line(move |line| {
            if let Some(handle) = trigger.on_robot_line(line) {
                *waits.lock() = Some(handle);
            }
        });
        robot.on_error(|error| report_device_error("robot", error));

        Self {
            config: config.clone(),
            caliper,
            robot,
            measurement,
            sequencer,
            pending_wait,
        }
    }

    /// Open the caliper, then the robot. If the robot fails to open, the caliper is
    /// closed again before the error is returned.
    pub async fn connect(&mut self) -> AppResult<()> {
        let caliper = &self.config.caliper;
        self.caliper
            .connect(&caliper.path, &caliper.port_options())
            .await?;

        let robot = &self.config.robot;
        let opened = self.robot.connect(&robot.path, &robot.port_options()).await;
        if let Err(e) = opened {
            warn!(path = %robot.path, error = %e, "Robot failed to open; closing caliper");
            self.shutdown();
            return Err(e.into());
        }
        Ok(())
    }

    /// Process device events, finished captures and console commands until `quit` or
    /// until the command channel closes, then disconnect.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<ConsoleCommand>) -> AppResult<()> {
        info!("Sorter running");

        loop {
            tokio::select! {
                _ = self.caliper.process_next() => {}
                _ = self.robot.process_next() => {}
                Some(outcome) = self.sequencer.next_completion() => {
                    self.complete_capture(outcome);
                }
                command = commands.recv() => match command {
                    Some(ConsoleCommand::Quit) | None => break,
                    Some(command) => {
                        if let Some(reply) = self.handle_command(command) {
                            println!("{reply}");
                        }
                    }
                },
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Apply a console command and return the text to show the operator.
    pub fn handle_command(&mut self, command: ConsoleCommand) -> Option<String> {
        match command {
            ConsoleCommand::Zero(millimetres) => {
                let target = millimetres_to_hundredths(millimetres);
                let mut state = self.measurement.lock();
                if state.last_raw().is_none() {
                    return Some("No caliper reading yet; cannot zero".to_string());
                }
                let reply = match state.zero_to(target) {
                    Some(offset) => {
                        info!(target, offset, "Zero offset updated");
                        format!(
                            "Zeroed at {} mm (offset {} mm)",
                            format_millimetres(target),
                            format_millimetres(offset)
                        )
                    }
                    None => format!(
                        "Cannot zero at {} mm; offset out of range",
                        format_millimetres(target)
                    ),
                };
                Some(reply)
            }
            ConsoleCommand::Clear => {
                self.sequencer.table_mut().clear();
                info!("Capture table cleared");
                Some("Capture table cleared".to_string())
            }
            ConsoleCommand::Table => Some(render_table(self.sequencer.table())),
            ConsoleCommand::Status => Some(self.status()),
            ConsoleCommand::Quit => None,
        }
    }

    /// Send the robot its cup for a finished settle wait.
    pub fn complete_capture(&mut self, outcome: PollOutcome) {
        self.pending_wait.lock().take();

        let Some((capture, command)) = self.sequencer.finish(outcome) else {
            return;
        };

        if let Err(e) = self.robot.send(&command) {
            warn!(index = capture.index, label = %capture.label, error = %e, "Could not send cup command");
        }
    }

    /// Abort any settle wait and close both ports.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.pending_wait.lock().take() {
            handle.abort();
        }

        for connection in [&mut self.caliper, &mut self.robot] {
            if connection.is_open() {
                if let Err(e) = connection.disconnect() {
                    debug!(connection = connection.name(), error = %e, "Disconnect skipped");
                }
            }
        }
        info!("Sorter stopped");
    }

    /// Cup assignments so far.
    pub fn captures(&self) -> &CaptureTable {
        self.sequencer.table()
    }

    /// Shared measurement state.
    pub fn measurement(&self) -> SharedMeasurement {
        self.measurement.clone()
    }

    /// The caliper connection.
    pub fn caliper(&self) -> &SerialConnection {
        &self.caliper
    }

    /// The robot connection.
    pub fn robot(&self) -> &SerialConnection {
        &self.robot
    }

    fn status(&self) -> String {
        let state = self.measurement.lock();
        let reading = state
            .current()
            .map(format_millimetres)
            .unwrap_or_else(|| "-".to_string());
        let label = state
            .classification()
            .map(|c| c.label.clone())
            .unwrap_or_else(|| "-".to_string());

        format!(
            "caliper: {} | robot: {} | reading: {reading} mm | size: {label} | offset: {} mm | cups: {}",
            self.caliper.state().name(),
            self.robot.state().name(),
            format_millimetres(state.zero_offset()),
            self.sequencer.table().len()
        )
    }
}

impl fmt::Debug for SorterApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SorterApp")
            .field("caliper", &self.caliper)
            .field("robot", &self.robot)
            .field("sequencer", &self.sequencer)
            .finish()
    }
}

fn report_device_error(device: &str, error: &ReceiveError) {
    match error {
        ReceiveError::DeviceLost | ReceiveError::Disconnected => {
            error!(device, %error, "Device gone; restart the sorter to reconnect")
        }
        _ => debug!(device, %error, "Receive error reported"),
    }
}

fn render_table(table: &CaptureTable) -> String {
    if table.is_empty() {
        return "No captures yet".to_string();
    }

    table
        .entries()
        .iter()
        .map(|entry| {
            format!(
                "%{:02}  {:<8} hits {:<4} last {}",
                entry.index,
                entry.label,
                entry.hits,
                entry.last_seen.format("%H:%M:%S")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
