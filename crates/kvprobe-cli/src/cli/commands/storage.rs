//! Controls that inspect or reset storage rather than probe it.

use super::GlobalArgs;
use crate::exit_codes::{PROBE_FAILED, RUN_BLOCKED, SUCCESS};
use kvprobe_core::{ProbeConfig, ProbeError};

pub async fn estimate(global: &GlobalArgs, config: ProbeConfig) -> anyhow::Result<i32> {
    let session = super::settings::session(global, config);
    let result = session.check_estimate().await;
    session.teardown();
    match result {
        Ok(estimate) => {
            if global.json {
                println!("{}", serde_json::to_string_pretty(&estimate)?);
            }
            Ok(SUCCESS)
        }
        Err(e) => {
            tracing::debug!(error = %e, "estimate failed");
            Ok(PROBE_FAILED)
        }
    }
}

pub async fn persist(global: &GlobalArgs, config: ProbeConfig) -> anyhow::Result<i32> {
    let session = super::settings::session(global, config);
    let result = session.request_persistence().await;
    session.teardown();
    match result {
        Ok(persisted) => {
            if global.json {
                println!("{}", serde_json::json!({ "persisted": persisted }));
            }
            Ok(SUCCESS)
        }
        Err(e) => {
            tracing::debug!(error = %e, "persistence request failed");
            Ok(PROBE_FAILED)
        }
    }
}

pub async fn clear(global: &GlobalArgs, config: ProbeConfig) -> anyhow::Result<i32> {
    let session = super::settings::session(global, config);
    let result = session.clear_all().await;
    session.teardown();
    let code = match &result {
        Ok(()) => SUCCESS,
        Err(ProbeError::DeleteBlocked(_)) => RUN_BLOCKED,
        Err(_) => PROBE_FAILED,
    };
    if global.json {
        println!(
            "{}",
            serde_json::json!({
                "cleared": result.is_ok(),
                "error": result.err().map(|e| e.to_string()),
            })
        );
    }
    Ok(code)
}
