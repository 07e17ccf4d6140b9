//! Record count: growing batches first, then one record at a time once a
//! batch fails, to find the exact ceiling.

use super::report::Finisher;
use super::{Outcome, Phase, ProbeContext, ProbeKind, ProbeReport, ProbeState};
use crate::config::CountConfig;
use crate::errors::ProbeError;
use crate::format::format_count;
use crate::gateway::COUNT_STORE;
use crate::payload::Payload;
use crate::sink::{Destination, Severity};

/// The record written by every count attempt.
pub fn item_record() -> Payload {
    Payload::json(&serde_json::json!({ "d": "item_padding_data_for_count_test" }))
}

pub async fn run(ctx: &ProbeContext<'_>, config: &CountConfig) -> ProbeReport {
    let log = ctx.gateway.channel(Destination::Count);
    let finisher = Finisher {
        probe: ProbeKind::Count,
        log: &log,
        unit_bytes: None,
    };
    let progress_max = config.target.saturating_mul(6) / 5;

    log.reset(
        "Starting item count test (batch add + single add)...",
        Severity::Info,
    );
    log.set_progress(0, progress_max);
    let mut state = ProbeState::new(Phase::Batch);
    state.current_step = config.initial_batch;

    if let Err(e) = ctx.gateway.open().await {
        return finisher.fail(&e, state, None);
    }
    log.info("Clearing existing count test data...");
    match ctx.gateway.clear(&[COUNT_STORE]).await {
        Ok(()) => log.info("Cleared. Starting the test."),
        Err(e) => log.warning(format!("Error clearing the store: {e}")),
    }

    let item = item_record();
    let safety_limit = config.target.saturating_mul(config.safety_multiple);
    let mut last_logged = None;

    loop {
        let count = state.lower_bound;
        if ctx.abort.is_requested() {
            state.aborted = true;
            return finisher.finish(
                Outcome::Aborted,
                Severity::Warning,
                format!(
                    "Test aborted by user. Last confirmed count: {}.",
                    format_count(count)
                ),
                state,
                Some(count),
            );
        }

        state.trial_count += 1;
        let trial = state.trial_count;
        if !ctx
            .gate
            .check_limit(
                trial,
                config.trial_frequency,
                ProbeKind::Count.label(),
                &log,
                ctx.abort,
            )
            .await
        {
            ctx.abort.request();
            state.aborted = true;
            return finisher.finish(
                Outcome::Aborted,
                Severity::Warning,
                format!("Test stopped by user after {trial} trials."),
                state,
                Some(count),
            );
        }

        if state.phase == Phase::Batch {
            let batch = state.current_step;
            if batch > config.max_batch {
                log.warning(format!(
                    "Batch size ({}) is too large; switching to single add mode.",
                    format_count(batch)
                ));
                state.phase = Phase::Single;
                continue;
            }
            log.progress(format!(
                "Phase 'batch': adding {} items (currently {})...",
                format_count(batch),
                format_count(count)
            ));
            match ctx.gateway.batch_add(COUNT_STORE, batch, &item).await {
                Ok(()) => {
                    state.lower_bound += batch;
                    let count = state.lower_bound;
                    log.set_progress(count, progress_max);
                    log.info(format!(
                        "Added {} items. Total {}.",
                        format_count(batch),
                        format_count(count)
                    ));
                    state.current_step = batch
                        .saturating_mul(config.batch_growth)
                        .min(config.max_batch);
                    if count >= config.target {
                        return finisher.finish(
                            Outcome::TargetReached,
                            Severity::Success,
                            format!(
                                "Test succeeded (batch): stored at least {} items ({}).",
                                format_count(config.target),
                                format_count(count)
                            ),
                            state,
                            Some(count),
                        );
                    }
                }
                Err(e) if e.is_connection_level() => {
                    return finisher.fail(&e, state, Some(count));
                }
                Err(e) => {
                    if let ProbeError::PartialBatchFailure { committed, .. } = &e {
                        state.lower_bound += *committed;
                    }
                    tracing::debug!(batch, error = %e, "batch add failed");
                    log.warning(format!(
                        "Batch add of {} items failed ({}); switching to single add mode.",
                        format_count(batch),
                        e.name()
                    ));
                    state.phase = Phase::Single;
                    log.set_progress(state.lower_bound, progress_max);
                }
            }
            continue;
        }

        if count.checked_rem(config.log_every) == Some(0) && last_logged != Some(count) {
            log.progress(format!(
                "Phase 'single': adding item {}...",
                format_count(count + 1)
            ));
            last_logged = Some(count);
        }
        match ctx.gateway.add(COUNT_STORE, item.clone(), None).await {
            Ok(_) => {
                state.lower_bound += 1;
                let count = state.lower_bound;
                log.set_progress(count, progress_max);
                if count == config.target {
                    if config.stop_at_target {
                        return finisher.finish(
                            Outcome::TargetReached,
                            Severity::Success,
                            format!(
                                "Test succeeded (single): stored {} items.",
                                format_count(count)
                            ),
                            state,
                            Some(count),
                        );
                    }
                    log.info(format!(
                        "Reached the target of {} items in single mode; continuing to find the limit.",
                        format_count(config.target)
                    ));
                }
                if count > safety_limit {
                    return finisher.finish(
                        Outcome::Exhausted,
                        Severity::Warning,
                        format!(
                            "Count far exceeded the target ({}) at {}; stopping. The limit is likely very high.",
                            format_count(config.target),
                            format_count(count)
                        ),
                        state,
                        Some(count),
                    );
                }
            }
            Err(e) if e.is_connection_level() => {
                return finisher.fail(&e, state, Some(count));
            }
            Err(e) => {
                state.upper_bound = Some(count + 1);
                let message = if e.is_quota() {
                    format!(
                        "Item count limit reached ({}). Estimated limit: {} items.",
                        e.name(),
                        format_count(count)
                    )
                } else {
                    format!(
                        "Unexpected error adding item {} ({}): {e}. Estimated limit: {} items.",
                        format_count(count + 1),
                        e.name(),
                        format_count(count)
                    )
                };
                return finisher.finish(Outcome::LimitFound, Severity::Error, message, state, Some(count));
            }
        }
    }
}
