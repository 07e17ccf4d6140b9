//! Largest single record: exponential growth until the first failure, then
//! binary search between the last success and the first failure.

use super::report::Finisher;
use super::{Outcome, Phase, ProbeContext, ProbeKind, ProbeReport, ProbeState};
use crate::config::SizeConfig;
use crate::format::format_bytes;
use crate::gateway::SIZE_STORE;
use crate::payload::Payload;
use crate::sink::{Destination, Severity};
use crate::storage::Key;

/// Key overwritten by every attempt.
pub const TEST_KEY: &str = "single_item_test_key";

/// Search over record sizes, in units.
///
/// Invariant once binary: `lower < upper`, `lower` only grows and `upper`
/// only shrinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSearch {
    lower: u64,
    upper: Option<u64>,
    current: u64,
    phase: Phase,
    precision: u64,
    target: u64,
}

/// What a failed attempt means for the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    /// The bound moved; keep searching.
    Narrowed,
    /// Bounds are within precision of each other.
    Converged,
    /// The very first attempt failed, nothing is known to fit.
    NothingFits,
}

impl SizeSearch {
    pub fn new(target: u64, precision: u64) -> Self {
        Self {
            lower: 0,
            upper: None,
            current: 1,
            phase: Phase::Exponential,
            precision: precision.max(1),
            target,
        }
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> Option<u64> {
        self.upper
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn converged(&self) -> bool {
        self.phase == Phase::Binary
            && self
                .upper
                .is_some_and(|upper| upper.saturating_sub(self.lower) <= self.precision)
    }

    /// Next size to try, or `None` when the search is complete and the limit
    /// is [`SizeSearch::lower`].
    pub fn next_size(&mut self) -> Option<u64> {
        if self.phase == Phase::Exponential {
            match self.upper {
                Some(upper) if self.current >= upper => self.phase = Phase::Binary,
                _ => return Some(self.current),
            }
        }
        let upper = self.upper?;
        if upper.saturating_sub(self.lower) <= self.precision {
            return None;
        }
        let mut candidate = self.lower + ((upper - self.lower) / 2).max(1);
        if candidate >= upper {
            candidate = (self.lower + 1).max(upper.saturating_sub(1));
            if candidate <= self.lower {
                return None;
            }
        }
        Some(candidate)
    }

    /// Record a stored size. Returns true when the target is reached.
    pub fn record_success(&mut self, size: u64) -> bool {
        self.lower = self.lower.max(size);
        if self.lower >= self.target {
            return true;
        }
        if self.phase == Phase::Exponential {
            self.current = size.saturating_mul(2);
            if self.upper.is_some_and(|upper| self.current >= upper) {
                self.phase = Phase::Binary;
            }
        }
        false
    }

    pub fn record_failure(&mut self, size: u64) -> FailureEffect {
        self.upper = Some(self.upper.map_or(size, |upper| upper.min(size)));
        if self.phase == Phase::Exponential {
            self.phase = Phase::Binary;
            if self.lower == 0 {
                return FailureEffect::NothingFits;
            }
        }
        if self.converged() {
            FailureEffect::Converged
        } else {
            FailureEffect::Narrowed
        }
    }

    fn snapshot(&self, state: &mut ProbeState) {
        state.lower_bound = self.lower;
        state.upper_bound = self.upper;
        state.phase = self.phase;
    }
}

pub async fn run(ctx: &ProbeContext<'_>, config: &SizeConfig) -> ProbeReport {
    let log = ctx.gateway.channel(Destination::SingleSize);
    let unit = config.unit_bytes;
    let bytes = |units: u64| format_bytes(units.saturating_mul(unit));
    let finisher = Finisher {
        probe: ProbeKind::SingleSize,
        log: &log,
        unit_bytes: Some(unit),
    };

    log.reset(
        "Starting single item size test (exponential growth + binary search)...",
        Severity::Info,
    );
    log.set_progress(0, config.target_mb);
    let mut state = ProbeState::new(Phase::Exponential);
    let mut search = SizeSearch::new(config.target_mb, config.precision_mb);

    if let Err(e) = ctx.gateway.open().await {
        return finisher.fail(&e, state, None);
    }
    match ctx
        .gateway
        .put(SIZE_STORE, Key::from(TEST_KEY), Payload::empty())
        .await
    {
        Ok(()) => log.info("Cleared the previous test key."),
        Err(e) => log.warning(format!("Error clearing the test key: {e}")),
    }

    loop {
        if ctx.abort.is_requested() {
            state.aborted = true;
            search.snapshot(&mut state);
            let lower = search.lower();
            return finisher.finish(
                Outcome::Aborted,
                Severity::Warning,
                format!("Test aborted by user. Largest size stored: {}.", bytes(lower)),
                state,
                Some(lower),
            );
        }

        state.trial_count += 1;
        let trial = state.trial_count;
        if !ctx
            .gate
            .check_limit(
                trial,
                config.trial_frequency,
                ProbeKind::SingleSize.label(),
                &log,
                ctx.abort,
            )
            .await
        {
            ctx.abort.request();
            state.aborted = true;
            search.snapshot(&mut state);
            let lower = search.lower();
            return finisher.finish(
                Outcome::Aborted,
                Severity::Warning,
                format!("Test stopped by user after {trial} trials."),
                state,
                Some(lower),
            );
        }

        let phase_before = search.phase();
        let Some(size) = search.next_size() else {
            search.snapshot(&mut state);
            let lower = search.lower();
            return finisher.finish(
                Outcome::LimitFound,
                Severity::Success,
                format!("Binary search complete. Estimated limit: about {}.", bytes(lower)),
                state,
                Some(lower),
            );
        };
        state.current_step = size;
        if phase_before == Phase::Exponential && search.phase() == Phase::Binary {
            log.info(format!(
                "Exponential step ({}) reaches the known upper bound; switching to binary search.",
                bytes(size)
            ));
        }
        match (search.phase(), search.upper()) {
            (Phase::Binary, Some(upper)) => log.progress(format!(
                "Trial {trial} (binary): trying {} in [{}, {})...",
                bytes(size),
                bytes(search.lower()),
                bytes(upper)
            )),
            _ => log.progress(format!("Trial {trial} (exponential): trying {}...", bytes(size))),
        }
        log.set_progress(size, config.target_mb);

        let was_exponential = search.phase() == Phase::Exponential;
        let payload = match ctx.payloads.filler_units(size, unit) {
            Ok(payload) => payload,
            Err(e) => {
                log.warning(format!("Data generation error ({}): {e}", bytes(size)));
                let effect = search.record_failure(size);
                search.snapshot(&mut state);
                if let Some(report) =
                    after_failure(&finisher, &log, effect, was_exponential, &search, &bytes, size, &state)
                {
                    return report;
                }
                continue;
            }
        };

        match ctx.gateway.put(SIZE_STORE, Key::from(TEST_KEY), payload).await {
            Ok(()) => {
                let reached = search.record_success(size);
                search.snapshot(&mut state);
                log.set_progress(search.lower(), config.target_mb);
                log.info(format!("Stored {} successfully.", bytes(size)));
                if reached {
                    let lower = search.lower();
                    return finisher.finish(
                        Outcome::TargetReached,
                        Severity::Success,
                        format!(
                            "Test succeeded: stored at least {} in one record (confirmed size: {}).",
                            bytes(config.target_mb),
                            bytes(lower)
                        ),
                        state,
                        Some(lower),
                    );
                }
                if was_exponential && search.phase() == Phase::Binary {
                    log.info("Next exponential step exceeds the known upper bound; switching to binary search.");
                }
            }
            Err(e) if e.is_connection_level() => {
                search.snapshot(&mut state);
                return finisher.fail(&e, state, None);
            }
            Err(e) => {
                tracing::debug!(trial, size, error = %e, "size write failed");
                log.warning(format!(
                    "Storing {} failed ({}); the limit is below that.",
                    bytes(size),
                    e.name()
                ));
                let effect = search.record_failure(size);
                search.snapshot(&mut state);
                log.set_progress(search.lower(), config.target_mb);
                if let Some(report) =
                    after_failure(&finisher, &log, effect, was_exponential, &search, &bytes, size, &state)
                {
                    return report;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn after_failure(
    finisher: &Finisher<'_>,
    log: &crate::sink::Channel,
    effect: FailureEffect,
    was_exponential: bool,
    search: &SizeSearch,
    bytes: &dyn Fn(u64) -> String,
    size: u64,
    state: &ProbeState,
) -> Option<ProbeReport> {
    match effect {
        FailureEffect::NothingFits => Some(finisher.finish(
            Outcome::Failed,
            Severity::Error,
            format!(
                "The first attempt ({}) failed. The limit is very small or zero.",
                bytes(size)
            ),
            state.clone(),
            Some(0),
        )),
        FailureEffect::Converged => Some(finisher.finish(
            Outcome::LimitFound,
            Severity::Success,
            format!(
                "Binary search complete. Estimated limit: about {}.",
                bytes(search.lower())
            ),
            state.clone(),
            Some(search.lower()),
        )),
        FailureEffect::Narrowed => {
            if was_exponential {
                if let Some(upper) = search.upper() {
                    log.info(format!(
                        "Failure in the exponential phase; switching to binary search in [{}, {}).",
                        bytes(search.lower()),
                        bytes(upper)
                    ));
                }
            }
            None
        }
    }
}
