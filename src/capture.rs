//! Capture sequencing.
//!
//! When the robot reports that a bit is in the caliper jaws (the sentinel line, `%m`),
//! the sequencer waits for the caliper reading to settle, records the bit's size in the
//! [`CaptureTable`], and answers the robot with the cup index for that size
//! (`%<index>\n`, index zero-padded to two digits).
//!
//! The pieces are split along ownership lines:
//!
//! - [`CaptureTrigger`] is cheap to clone and lives in the robot line listener. It starts
//!   the settle wait and reports the outcome over a channel.
//! - [`CaptureSequencer`] lives with the code that owns the robot connection. It turns a
//!   finished wait into a capture and the command to send.
//!
//! Only one wait runs at a time; a sentinel that arrives while a wait is in flight is
//! ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::measurement::SharedMeasurement;
use crate::poller::{spawn_wait_for, PollOutcome, PollSettings};

/// Line the robot sends when a bit is ready to be measured.
pub const DEFAULT_SENTINEL: &str = "%m";

/// Largest reading change, in hundredths of a millimetre, still considered settled.
pub const DEFAULT_DELTA_THRESHOLD: i64 = 2;

/// Command telling the robot which cup to use.
pub fn format_command(index: u32) -> String {
    format!("%{index:02}\n")
}

/// One row of the capture table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEntry {
    /// Cup index, assigned in order of first appearance starting at 1
    pub index: u32,
    /// Classification label
    pub label: String,
    /// Number of times this label was captured
    pub hits: u32,
    /// When this label was last captured
    pub last_seen: DateTime<Local>,
}

/// Result of recording a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Cup index for the label
    pub index: u32,
    /// Classification label captured
    pub label: String,
    /// Whether this capture created the entry
    pub is_new: bool,
}

/// Cup assignments keyed by classification label.
#[derive(Debug, Clone, Default)]
pub struct CaptureTable {
    entries: HashMap<String, CaptureEntry>,
    last_index: u32,
}

impl CaptureTable {
    /// Empty table; the first label gets index 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a capture of `label`, assigning the next index on first sight.
    pub fn record(&mut self, label: &str) -> Capture {
        let now = Local::now();

        if let Some(entry) = self.entries.get_mut(label) {
            entry.hits += 1;
            entry.last_seen = now;
            return Capture {
                index: entry.index,
                label: entry.label.clone(),
                is_new: false,
            };
        }

        self.last_index += 1;
        self.entries.insert(
            label.to_string(),
            CaptureEntry {
                index: self.last_index,
                label: label.to_string(),
                hits: 1,
                last_seen: now,
            },
        );

        Capture {
            index: self.last_index,
            label: label.to_string(),
            is_new: true,
        }
    }

    /// Entry for `label`.
    pub fn get(&self, label: &str) -> Option<&CaptureEntry> {
        self.entries.get(label)
    }

    /// Entries ordered by index.
    pub fn entries(&self) -> Vec<&CaptureEntry> {
        let mut entries: Vec<&CaptureEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.index);
        entries
    }

    /// Number of distinct labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every assignment; the next label gets index 1 again.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_index = 0;
    }
}

/// Tuning for the capture sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Robot line (trimmed) that starts a capture
    pub sentinel: String,
    /// Reading change above which the caliper is still moving
    pub delta_threshold: i64,
    /// Settle-wait schedule
    pub poll: PollSettings,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            poll: PollSettings::default(),
        }
    }
}

/// Starts settle waits from the robot line listener.
#[derive(Clone)]
pub struct CaptureTrigger {
    settings: Arc<CaptureSettings>,
    measurement: SharedMeasurement,
    in_flight: Arc<AtomicBool>,
    completions: mpsc::UnboundedSender<PollOutcome>,
}

impl CaptureTrigger {
    /// Whether `line` is the capture sentinel.
    pub fn is_sentinel(&self, line: &str) -> bool {
        line.trim() == self.settings.sentinel
    }

    /// React to a robot line. Starts a settle wait for the sentinel unless one is
    /// already running; returns its handle when a wait was started.
    pub fn on_robot_line(&self, line: &str) -> Option<JoinHandle<()>> {
        if !self.is_sentinel(line) {
            return None;
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("Capture already in progress; ignoring sentinel");
            return None;
        }

        debug!(threshold = self.settings.delta_threshold, "Waiting for caliper to settle");

        let measurement = self.measurement.clone();
        let threshold = self.settings.delta_threshold;
        let completions = self.completions.clone();
        let guard = InFlightGuard::new(self.in_flight.clone());

        Some(spawn_wait_for(
            move || measurement.lock().delta_exceeds(threshold),
            false,
            self.settings.poll,
            move |outcome| match completions.send(outcome) {
                // The sequencer releases the guard once it processes the outcome
                Ok(()) => guard.hand_off(),
                Err(_) => debug!("Capture sequencer dropped before the wait finished"),
            },
        ))
    }

    /// Whether a settle wait is running or awaiting completion.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Holds the single-capture flag for a settle wait.
///
/// Dropped without [`hand_off`](Self::hand_off) it clears the flag, so an aborted or
/// panicked wait does not block the next sentinel.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl InFlightGuard {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    /// The outcome reached the sequencer, which now owns the flag.
    fn hand_off(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Turns finished settle waits into captures.
pub struct CaptureSequencer {
    trigger: CaptureTrigger,
    completions: mpsc::UnboundedReceiver<PollOutcome>,
    table: CaptureTable,
}

impl CaptureSequencer {
    /// Create a sequencer reading from `measurement`.
    pub fn new(settings: CaptureSettings, measurement: SharedMeasurement) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            trigger: CaptureTrigger {
                settings: Arc::new(settings),
                measurement,
                in_flight: Arc::new(AtomicBool::new(false)),
                completions: tx,
            },
            completions: rx,
            table: CaptureTable::new(),
        }
    }

    /// Handle for the robot line listener.
    pub fn trigger(&self) -> CaptureTrigger {
        self.trigger.clone()
    }

    /// Capture assignments so far.
    pub fn table(&self) -> &CaptureTable {
        &self.table
    }

    /// Mutable access to the capture assignments.
    pub fn table_mut(&mut self) -> &mut CaptureTable {
        &mut self.table
    }

    /// Wait for the next finished settle wait.
    pub async fn next_completion(&mut self) -> Option<PollOutcome> {
        self.completions.recv().await
    }

    /// Record the current classification after a settle wait and build the robot
    /// command. Both outcomes are handled the same way.
    ///
    /// Returns `None`, recording nothing, when no classification is available.
    pub fn finish(&mut self, outcome: PollOutcome) -> Option<(Capture, String)> {
        self.trigger.in_flight.store(false, Ordering::SeqCst);

        if !outcome.is_satisfied() {
            warn!(
                evaluations = outcome.evaluations(),
                "Caliper did not settle; capturing anyway"
            );
        }

        let classification = self.trigger.measurement.lock().classification().cloned();
        let Some(classification) = classification else {
            warn!("No classified reading available; nothing captured");
            return None;
        };

        let capture = self.table.record(&classification.label);
        info!(
            index = capture.index,
            label = %capture.label,
            new = capture.is_new,
            "Captured"
        );

        let command = format_command(capture.index);
        Some((capture, command))
    }
}

impl std::fmt::Debug for CaptureSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSequencer")
            .field("settings", &self.trigger.settings)
            .field("in_flight", &self.trigger.in_flight())
            .field("captures", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::LookupTable;
    use crate::measurement::MeasurementState;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_format_command_pads_to_two_digits() {
        assert_eq!(format_command(3), "%03\n");
        assert_eq!(format_command(7), "%07\n");
        assert_eq!(format_command(15), "%15\n");
        assert_eq!(format_command(123), "%123\n");
    }

    #[test]
    fn test_capture_indexing() {
        let mut table = CaptureTable::new();

        let first = table.record("M3");
        assert_eq!((first.index, first.is_new), (1, true));

        let second = table.record("M4");
        assert_eq!((second.index, second.is_new), (2, true));

        let repeat = table.record("M3");
        assert_eq!((repeat.index, repeat.is_new), (1, false));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("M3").unwrap().hits, 2);
        let labels: Vec<&str> = table.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["M3", "M4"]);
    }

    #[test]
    fn test_clear_restarts_indices() {
        let mut table = CaptureTable::new();
        table.record("M3");
        table.record("M4");

        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.record("M4").index, 1);
    }

    #[tokio::test]
    async fn test_trigger_ignores_other_lines() {
        let sequencer = CaptureSequencer::new(CaptureSettings::default(), MeasurementState::shared());
        let trigger = sequencer.trigger();

        assert!(trigger.is_sentinel("  %m\r\n"));
        assert!(trigger.on_robot_line("%01\n").is_none());
        assert!(!trigger.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_capture_in_flight() {
        let measurement = MeasurementState::shared();
        {
            let mut state = measurement.lock();
            state.record(100);
            state.record(200);
        }
        let mut sequencer = CaptureSequencer::new(CaptureSettings::default(), measurement.clone());
        let trigger = sequencer.trigger();

        let first = trigger.on_robot_line("%m\n");
        assert!(first.is_some());
        assert!(trigger.in_flight());
        assert!(trigger.on_robot_line("%m\n").is_none());

        // Caliper settles
        tokio::time::sleep(Duration::from_millis(50)).await;
        measurement.lock().record(201);

        let outcome = sequencer.next_completion().await.unwrap();
        assert!(outcome.is_satisfied());
        assert_eq!(sequencer.finish(outcome), None);
        assert!(!trigger.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_readings_still_capture() {
        let table = LookupTable::from_entries([(0, "zero")]);
        let measurement = MeasurementState::shared();
        {
            let mut state = measurement.lock();
            state.record_classified(i64::MAX, &table);
            state.record_classified(-i64::MAX, &table);
        }
        let mut sequencer = CaptureSequencer::new(CaptureSettings::default(), measurement.clone());
        let trigger = sequencer.trigger();

        // The wait keeps polling a huge delta and runs out of budget without panicking
        trigger.on_robot_line("%m").unwrap().await.unwrap();
        let outcome = sequencer.next_completion().await.unwrap();
        assert!(!outcome.is_satisfied());
        let (capture, command) = sequencer.finish(outcome).unwrap();
        assert_eq!(capture.label, "zero");
        assert_eq!(command, "%01\n");

        // The next sentinel starts a fresh wait
        assert!(trigger.on_robot_line("%m").is_some());
        assert!(trigger.in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_wait_releases_guard() {
        let measurement = MeasurementState::shared();
        {
            let mut state = measurement.lock();
            state.record(100);
            state.record(200);
        }
        let sequencer = CaptureSequencer::new(CaptureSettings::default(), measurement);
        let trigger = sequencer.trigger();

        let wait = trigger.on_robot_line("%m").unwrap();
        assert!(trigger.in_flight());
        wait.abort();
        assert!(wait.await.unwrap_err().is_cancelled());

        assert!(!trigger.in_flight());
        assert!(trigger.on_robot_line("%m").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sequencer_releases_guard() {
        let sequencer = CaptureSequencer::new(CaptureSettings::default(), MeasurementState::shared());
        let trigger = sequencer.trigger();
        drop(sequencer);

        trigger.on_robot_line("%m").unwrap().await.unwrap();

        assert!(!trigger.in_flight());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_overlapping_sentinel_is_logged() {
        let measurement = MeasurementState::shared();
        let mut sequencer = CaptureSequencer::new(CaptureSettings::default(), measurement);
        let trigger = sequencer.trigger();

        trigger.on_robot_line("%m");
        trigger.on_robot_line("%m");

        assert!(logs_contain("Capture already in progress"));
        let outcome = sequencer.next_completion().await.unwrap();
        assert!(sequencer.finish(outcome).is_none());
        assert!(logs_contain("No classified reading available"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_records_and_formats() {
        let table = LookupTable::from_entries([(159, "1/16"), (198, "5/64")]);
        let measurement = MeasurementState::shared();
        assert_eq!(measurement.lock().record_classified(197, &table), Some(197));

        let mut sequencer = CaptureSequencer::new(CaptureSettings::default(), measurement.clone());
        sequencer.trigger().on_robot_line("%m");
        let outcome = sequencer.next_completion().await.unwrap();

        let (capture, command) = sequencer.finish(outcome).unwrap();
        assert_eq!(capture.label, "5/64");
        assert_eq!(command, "%01\n");

        // Exhausted waits capture the same way
        let (again, command) = sequencer
            .finish(PollOutcome::Exhausted { evaluations: 21 })
            .unwrap();
        assert_eq!((again.index, again.is_new), (1, false));
        assert_eq!(command, "%01\n");
    }
}
