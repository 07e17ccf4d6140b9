//! Event output: per-destination log lines, progress and control state.
//!
//! Probes never print. They write through an [`EventSink`], which a CLI
//! renders to the terminal and tests record with [`RecordingSink`]. Every
//! event is mirrored to `tracing` as well.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where a message belongs, one per probe plus general areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Storage,
    Persist,
    Capacity,
    SingleSize,
    Count,
    Clear,
}

impl Destination {
    pub const ALL: [Destination; 6] = [
        Destination::Storage,
        Destination::Persist,
        Destination::Capacity,
        Destination::SingleSize,
        Destination::Count,
        Destination::Clear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Storage => "storage",
            Destination::Persist => "persist",
            Destination::Capacity => "capacity",
            Destination::SingleSize => "single_size",
            Destination::Count => "count",
            Destination::Clear => "clear",
        }
    }

    /// Destinations that carry a progress indicator.
    pub fn has_progress(&self) -> bool {
        matches!(
            self,
            Destination::Capacity | Destination::SingleSize | Destination::Count
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
    Progress,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub destination: Destination,
    pub message: String,
    pub severity: Severity,
    /// Clear the destination's earlier messages before this one.
    pub reset_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub destination: Destination,
    pub value: u64,
    pub max: u64,
}

pub trait EventSink: Send + Sync {
    fn log(&self, event: LogEvent);

    fn progress(&self, update: ProgressUpdate);

    /// Drop everything logged to `destination` so far.
    fn clear(&self, destination: Destination);

    /// Enable or disable the user-facing controls (false while a run is active).
    fn controls(&self, enabled: bool);
}

/// Writer bound to one destination.
#[derive(Clone)]
pub struct Channel {
    sink: Arc<dyn EventSink>,
    destination: Destination,
}

impl Channel {
    pub fn new(sink: Arc<dyn EventSink>, destination: Destination) -> Self {
        Self { sink, destination }
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(message.into(), Severity::Info, false);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(message.into(), Severity::Success, false);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(message.into(), Severity::Warning, false);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(message.into(), Severity::Error, false);
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.emit(message.into(), Severity::Progress, false);
    }

    /// Replace everything previously logged to this destination.
    pub fn reset(&self, message: impl Into<String>, severity: Severity) {
        self.emit(message.into(), severity, true);
    }

    /// Empty the destination's log area.
    pub fn clear(&self) {
        tracing::trace!(destination = self.destination.as_str(), "log area cleared");
        self.sink.clear(self.destination);
    }

    pub fn set_progress(&self, value: u64, max: u64) {
        self.sink.progress(ProgressUpdate {
            destination: self.destination,
            value: value.min(max),
            max,
        });
    }

    fn emit(&self, message: String, severity: Severity, reset_before: bool) {
        let dest = self.destination.as_str();
        match severity {
            Severity::Error => tracing::error!(destination = dest, "{message}"),
            Severity::Warning => tracing::warn!(destination = dest, "{message}"),
            _ => tracing::debug!(destination = dest, ?severity, "{message}"),
        }
        self.sink.log(LogEvent {
            destination: self.destination,
            message,
            severity,
            reset_before,
        });
    }
}

/// In-memory sink keeping the most recent entries per destination.
#[derive(Default)]
pub struct RecordingSink {
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    logs: BTreeMap<Destination, VecDeque<LogEvent>>,
    progress: BTreeMap<Destination, ProgressUpdate>,
    controls: Vec<bool>,
}

impl RecordingSink {
    /// Entries kept per destination; older ones are dropped first.
    pub const MAX_ENTRIES: usize = 200;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, destination: Destination) -> Vec<LogEvent> {
        self.lock()
            .logs
            .get(&destination)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn messages(&self, destination: Destination) -> Vec<String> {
        self.events(destination)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    pub fn contains(&self, destination: Destination, needle: &str) -> bool {
        self.messages(destination).iter().any(|m| m.contains(needle))
    }

    pub fn last_progress(&self, destination: Destination) -> Option<ProgressUpdate> {
        self.lock().progress.get(&destination).copied()
    }

    /// Every `controls` call, in order.
    pub fn controls_history(&self) -> Vec<bool> {
        self.lock().controls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for RecordingSink {
    fn log(&self, event: LogEvent) {
        let mut inner = self.lock();
        let entries = inner.logs.entry(event.destination).or_default();
        if event.reset_before {
            entries.clear();
        }
        entries.push_back(event);
        while entries.len() > Self::MAX_ENTRIES {
            entries.pop_front();
        }
    }

    fn progress(&self, update: ProgressUpdate) {
        self.lock().progress.insert(update.destination, update);
    }

    fn clear(&self, destination: Destination) {
        self.lock().logs.remove(&destination);
    }

    fn controls(&self, enabled: bool) {
        self.lock().controls.push(enabled);
    }
}
