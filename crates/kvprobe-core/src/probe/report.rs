use crate::errors::ProbeError;
use crate::format::format_bytes;
use crate::sink::{Channel, Destination, Severity};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Capacity,
    SingleSize,
    Count,
}

impl ProbeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeKind::Capacity => "Capacity",
            ProbeKind::SingleSize => "Single item size",
            ProbeKind::Count => "Item count",
        }
    }

    pub fn destination(&self) -> Destination {
        match self {
            ProbeKind::Capacity => Destination::Capacity,
            ProbeKind::SingleSize => Destination::SingleSize,
            ProbeKind::Count => Destination::Count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The configured target was met before any failure.
    TargetReached,
    /// A write failure bounded the search; `estimate` holds the limit.
    LimitFound,
    /// The safety bound ended the run before any failure.
    Exhausted,
    /// Stopped by the user or the trial gate.
    Aborted,
    /// Ended by an error that says nothing about the limit.
    Failed,
}

impl Outcome {
    /// Whether the run produced a usable finding.
    pub fn is_conclusive(&self) -> bool {
        matches!(
            self,
            Outcome::TargetReached | Outcome::LimitFound | Outcome::Exhausted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Accumulating,
    Exponential,
    Binary,
    Batch,
    Single,
}

/// Search state of one probe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeState {
    /// Largest value confirmed to succeed.
    pub lower_bound: u64,
    /// Smallest value confirmed to fail.
    pub upper_bound: Option<u64>,
    pub current_step: u64,
    pub phase: Phase,
    pub trial_count: u64,
    pub aborted: bool,
}

impl ProbeState {
    pub fn new(phase: Phase) -> Self {
        Self {
            lower_bound: 0,
            upper_bound: None,
            current_step: 0,
            phase,
            trial_count: 0,
            aborted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub probe: ProbeKind,
    pub outcome: Outcome,
    /// The single summary line, also logged once to the probe's destination.
    pub message: String,
    pub state: ProbeState,
    /// Units for capacity and size, items for count.
    pub estimate: Option<u64>,
    /// Bytes per unit, for the byte-based probes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_bytes: Option<u64>,
    /// Name of the error that ended a failed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<&'static str>,
}

impl ProbeReport {
    pub fn estimate_bytes(&self) -> Option<u64> {
        Some(self.estimate?.saturating_mul(self.unit_bytes?))
    }

    pub fn estimate_display(&self) -> Option<String> {
        match (self.estimate, self.unit_bytes) {
            (Some(e), Some(unit)) => Some(format_bytes(e.saturating_mul(unit))),
            (Some(e), None) => Some(crate::format::format_count(e)),
            _ => None,
        }
    }
}

/// Assembles the terminal report and logs its message exactly once.
pub(crate) struct Finisher<'a> {
    pub probe: ProbeKind,
    pub log: &'a Channel,
    pub unit_bytes: Option<u64>,
}

impl Finisher<'_> {
    pub fn finish(
        &self,
        outcome: Outcome,
        severity: Severity,
        message: String,
        state: ProbeState,
        estimate: Option<u64>,
    ) -> ProbeReport {
        match severity {
            Severity::Success => self.log.success(message.clone()),
            Severity::Warning => self.log.warning(message.clone()),
            Severity::Error => self.log.error(message.clone()),
            Severity::Info | Severity::Progress => self.log.info(message.clone()),
        }
        tracing::info!(
            probe = ?self.probe,
            ?outcome,
            trials = state.trial_count,
            estimate,
            "probe finished"
        );
        ProbeReport {
            probe: self.probe,
            outcome,
            message,
            state,
            estimate,
            unit_bytes: self.unit_bytes,
            cause: None,
        }
    }

    /// End the run on an error that says nothing about the limit.
    pub fn fail(&self, e: &ProbeError, state: ProbeState, estimate: Option<u64>) -> ProbeReport {
        let message = format!("Unexpected error during the test ({}): {e}", e.name());
        ProbeReport {
            cause: Some(e.name()),
            ..self.finish(Outcome::Failed, Severity::Error, message, state, estimate)
        }
    }
}
