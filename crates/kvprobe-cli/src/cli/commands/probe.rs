use super::GlobalArgs;
use crate::exit_codes::{PROBE_FAILED, RUN_BLOCKED, SUCCESS};
use kvprobe_core::{Outcome, ProbeConfig, ProbeError, ProbeKind, ProbeReport};

pub async fn run(kind: ProbeKind, global: &GlobalArgs, config: ProbeConfig) -> anyhow::Result<i32> {
    let session = super::settings::session(global, config);

    let abort = session.abort_flag();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping the probe");
            abort.request();
        }
    });

    let result = match kind {
        ProbeKind::Capacity => session.run_capacity().await,
        ProbeKind::SingleSize => session.run_size().await,
        ProbeKind::Count => session.run_count().await,
    };
    ctrl_c.abort();
    session.teardown();

    let report = match result {
        Ok(report) => report,
        Err(ProbeError::RunInProgress) => {
            eprintln!("another probe is already running");
            return Ok(RUN_BLOCKED);
        }
        Err(e) => return Err(e.into()),
    };

    if global.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", summary(&report));
    }
    Ok(exit_code(&report))
}

pub fn summary(report: &ProbeReport) -> String {
    let estimate = report
        .estimate_display()
        .map(|e| format!(", estimate {e}"))
        .unwrap_or_default();
    format!(
        "{}: {:?}{estimate} after {} trials",
        report.probe.label(),
        report.outcome,
        report.state.trial_count
    )
}

pub fn exit_code(report: &ProbeReport) -> i32 {
    if report.outcome.is_conclusive() {
        return SUCCESS;
    }
    if report.outcome == Outcome::Failed && report.cause == Some("OpenBlocked") {
        return RUN_BLOCKED;
    }
    PROBE_FAILED
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvprobe_core::{Phase, ProbeState};

    fn report(outcome: Outcome, cause: Option<&'static str>) -> ProbeReport {
        ProbeReport {
            probe: ProbeKind::Count,
            outcome,
            message: String::new(),
            state: ProbeState::new(Phase::Single),
            estimate: Some(1_234),
            unit_bytes: None,
            cause,
        }
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(exit_code(&report(Outcome::LimitFound, None)), SUCCESS);
        assert_eq!(exit_code(&report(Outcome::Exhausted, None)), SUCCESS);
        assert_eq!(exit_code(&report(Outcome::Aborted, None)), PROBE_FAILED);
        assert_eq!(exit_code(&report(Outcome::Failed, Some("OpenError"))), PROBE_FAILED);
        assert_eq!(exit_code(&report(Outcome::Failed, Some("OpenBlocked"))), RUN_BLOCKED);
    }

    #[test]
    fn summary_formats_count_estimate() {
        assert_eq!(
            summary(&report(Outcome::LimitFound, None)),
            "Item count: LimitFound, estimate 1,234 after 0 trials"
        );
    }
}
