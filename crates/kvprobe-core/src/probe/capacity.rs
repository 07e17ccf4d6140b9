//! Total capacity: add fixed-size chunks until a write fails or the target
//! is reached.

use super::report::Finisher;
use super::{Outcome, Phase, ProbeContext, ProbeKind, ProbeReport, ProbeState};
use crate::config::CapacityConfig;
use crate::format::format_bytes;
use crate::gateway::CAPACITY_STORE;
use crate::sink::{Destination, Severity};
use crate::storage::Key;

pub async fn run(ctx: &ProbeContext<'_>, config: &CapacityConfig) -> ProbeReport {
    let log = ctx.gateway.channel(Destination::Capacity);
    let unit = config.unit_bytes;
    let bytes = |units: u64| format_bytes(units.saturating_mul(unit));
    let finisher = Finisher {
        probe: ProbeKind::Capacity,
        log: &log,
        unit_bytes: Some(unit),
    };

    log.reset("Starting capacity test...", Severity::Info);
    log.set_progress(0, config.target_mb);
    let mut state = ProbeState::new(Phase::Accumulating);
    state.current_step = config.chunk_mb;

    if let Err(e) = ctx.gateway.open().await {
        return finisher.fail(&e, state, None);
    }

    while state.lower_bound < config.target_mb {
        if ctx.abort.is_requested() {
            state.aborted = true;
            let total = state.lower_bound;
            return finisher.finish(
                Outcome::Aborted,
                Severity::Warning,
                format!("Test aborted by user. Confirmed so far: {}.", bytes(total)),
                state,
                Some(total),
            );
        }

        state.trial_count += 1;
        let trial = state.trial_count;
        if !ctx
            .gate
            .check_limit(
                trial,
                config.trial_frequency,
                ProbeKind::Capacity.label(),
                &log,
                ctx.abort,
            )
            .await
        {
            ctx.abort.request();
            state.aborted = true;
            let total = state.lower_bound;
            return finisher.finish(
                Outcome::Aborted,
                Severity::Warning,
                format!("Test stopped by user after {trial} trials."),
                state,
                Some(total),
            );
        }

        let chunk = bytes(config.chunk_mb);
        log.progress(format!("Trial {trial}: generating {chunk} of data..."));
        let payload = match ctx.payloads.filler_units(config.chunk_mb, unit) {
            Ok(payload) => payload,
            Err(e) => {
                log.warning(format!("Data generation error ({chunk}): {e}"));
                let total = state.lower_bound;
                return finisher.finish(
                    Outcome::Failed,
                    Severity::Error,
                    format!("Test failed: could not generate a {chunk} chunk."),
                    state,
                    Some(total),
                );
            }
        };

        log.progress(format!(
            "Trial {trial}: adding {chunk}... (total: {})",
            bytes(state.lower_bound)
        ));
        let key = Key::from(format!(
            "capacity_data_{}_{trial}",
            chrono::Utc::now().timestamp_millis()
        ));
        match ctx.gateway.add(CAPACITY_STORE, payload, Some(key)).await {
            Ok(_) => {
                state.lower_bound += config.chunk_mb;
                log.set_progress(state.lower_bound, config.target_mb);
                log.info(format!(
                    "Trial {trial}: added {chunk}. Total {}.",
                    bytes(state.lower_bound)
                ));
            }
            Err(e) if e.is_connection_level() => {
                return finisher.fail(&e, state, None);
            }
            Err(e) => {
                tracing::debug!(trial, error = %e, "capacity write failed");
                let total = state.lower_bound;
                state.upper_bound = Some(total + config.chunk_mb);
                let message = if e.is_quota() {
                    format!(
                        "Quota exceeded ({}). Estimated limit: about {} (hit while adding {chunk}).",
                        e.name(),
                        bytes(total)
                    )
                } else {
                    format!(
                        "Error at trial {trial} ({}): {e}. Estimated limit: about {}.",
                        e.name(),
                        bytes(total)
                    )
                };
                return finisher.finish(Outcome::LimitFound, Severity::Error, message, state, Some(total));
            }
        }
    }

    let total = state.lower_bound;
    finisher.finish(
        Outcome::TargetReached,
        Severity::Success,
        format!(
            "Test succeeded: confirmed at least {} of capacity (total: {}).",
            bytes(config.target_mb),
            bytes(total)
        ),
        state,
        Some(total),
    )
}
