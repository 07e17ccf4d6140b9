//! The three probe algorithms.
//!
//! Each probe is a loop over the gateway's write primitives that polls the
//! abort flag at the top of every iteration, consults the trial gate at its
//! configured frequency and ends with exactly one [`ProbeReport`].

pub mod capacity;
pub mod count;
mod report;
pub mod size;

pub use report::{Outcome, Phase, ProbeKind, ProbeReport, ProbeState};

use crate::gate::TrialGate;
use crate::gateway::StorageGateway;
use crate::payload::PayloadFactory;
use crate::session::AbortFlag;

/// Shared collaborators for one probe run.
pub struct ProbeContext<'a> {
    pub gateway: &'a StorageGateway,
    pub gate: &'a TrialGate,
    pub abort: &'a AbortFlag,
    pub payloads: &'a PayloadFactory,
}
