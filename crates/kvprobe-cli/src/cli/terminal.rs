//! Renders sink events as tagged terminal lines.

use kvprobe_core::{Destination, EventSink, LogEvent, ProgressUpdate, Severity};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

pub struct TerminalSink {
    stream: Stream,
    quiet: bool,
    /// Last printed progress decile per destination.
    deciles: Mutex<BTreeMap<Destination, u64>>,
}

impl TerminalSink {
    pub fn new(stream: Stream, quiet: bool) -> Self {
        Self {
            stream,
            quiet,
            deciles: Mutex::default(),
        }
    }

    fn write_lines(&self, text: &str) {
        let result = match self.stream {
            Stream::Stdout => writeln!(std::io::stdout().lock(), "{text}"),
            Stream::Stderr => writeln!(std::io::stderr().lock(), "{text}"),
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "terminal write failed");
        }
    }
}

pub fn tag(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Success => " ok ",
        Severity::Error => "FAIL",
        Severity::Progress => " .. ",
        Severity::Warning => "warn",
    }
}

pub fn render(event: &LogEvent) -> String {
    let prefix = format!("[{}] {:<11}", tag(event.severity), event.destination.as_str());
    event
        .message
        .lines()
        .map(|line| format!("{prefix} {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl EventSink for TerminalSink {
    fn log(&self, event: LogEvent) {
        if self.quiet {
            return;
        }
        if event.reset_before {
            self.deciles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&event.destination);
        }
        self.write_lines(&render(&event));
    }

    fn progress(&self, update: ProgressUpdate) {
        if self.quiet || update.max == 0 {
            return;
        }
        let decile = update.value.saturating_mul(10) / update.max;
        let mut deciles = self.deciles.lock().unwrap_or_else(PoisonError::into_inner);
        if deciles.get(&update.destination) == Some(&decile) {
            return;
        }
        deciles.insert(update.destination, decile);
        drop(deciles);
        self.write_lines(&format!(
            "[ {:>3}%] {:<11} {}/{}",
            decile * 10,
            update.destination.as_str(),
            update.value,
            update.max
        ));
    }

    fn clear(&self, destination: Destination) {
        self.deciles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&destination);
    }

    fn controls(&self, enabled: bool) {
        tracing::trace!(enabled, "controls");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_messages_are_prefixed_per_line() {
        let event = LogEvent {
            destination: Destination::Storage,
            message: "Current usage: 0 Bytes\nQuota: unknown".to_string(),
            severity: Severity::Success,
            reset_before: false,
        };
        assert_eq!(
            render(&event),
            "[ ok ] storage     Current usage: 0 Bytes\n[ ok ] storage     Quota: unknown"
        );
    }

    #[test]
    fn error_lines_are_tagged_fail() {
        let event = LogEvent {
            destination: Destination::Count,
            message: "limit".to_string(),
            severity: Severity::Error,
            reset_before: true,
        };
        assert!(render(&event).starts_with("[FAIL] count"));
    }
}
