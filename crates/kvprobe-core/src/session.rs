//! The user-facing controls and the state they share.
//!
//! A [`ProbeSession`] owns the gateway, the abort flag and the
//! run-in-progress flag. Only one control runs at a time; probes reset the
//! abort flag when they start and poll it at every checkpoint.

use crate::config::ProbeConfig;
use crate::environment::{StorageEnvironment, StorageEstimate};
use crate::errors::{EnvironmentError, ProbeError};
use crate::format::format_bytes;
use crate::gate::{Confirmer, TrialGate};
use crate::gateway::{StorageGateway, CAPACITY_STORE, COUNT_STORE, SIZE_STORE};
use crate::payload::PayloadFactory;
use crate::probe::{capacity, count, size, ProbeContext, ProbeKind, ProbeReport};
use crate::sink::{Channel, Destination, EventSink, Severity};
use crate::storage::StorageBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;

/// Cooperative stop signal. Probes never clear it themselves.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Holds the run flag; controls are disabled for its lifetime.
struct RunGuard<'a> {
    running: &'a AtomicBool,
    sink: &'a dyn EventSink,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool, sink: &'a dyn EventSink) -> Result<Self, ProbeError> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ProbeError::RunInProgress)?;
        sink.controls(false);
        Ok(Self { running, sink })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.sink.controls(true);
    }
}

pub struct ProbeSession {
    config: ProbeConfig,
    gateway: StorageGateway,
    environment: Option<Arc<dyn StorageEnvironment>>,
    sink: Arc<dyn EventSink>,
    gate: TrialGate,
    payloads: PayloadFactory,
    abort: AbortFlag,
    running: AtomicBool,
}

impl ProbeSession {
    pub fn new(
        config: ProbeConfig,
        backend: Arc<dyn StorageBackend>,
        sink: Arc<dyn EventSink>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let gateway = StorageGateway::new(backend, config.database_spec(), Arc::clone(&sink))
            .with_delete_grace(config.delete_grace());
        let gate = TrialGate::new(confirmer).with_pause(config.gate_pause());
        let payloads = config.payload_factory();
        Self {
            config,
            gateway,
            environment: None,
            sink,
            gate,
            payloads,
            abort: AbortFlag::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Build the backend and environment described by `config.backend`.
    pub fn from_config(
        config: ProbeConfig,
        sink: Arc<dyn EventSink>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let built = config.backend.build();
        Self::new(config, built.backend, sink, confirmer).with_environment(built.environment)
    }

    pub fn with_environment(mut self, environment: Arc<dyn StorageEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn gateway(&self) -> &StorageGateway {
        &self.gateway
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn run_capacity(&self) -> Result<ProbeReport, ProbeError> {
        let _guard = self.start_probe()?;
        let span = tracing::info_span!("probe", kind = ?ProbeKind::Capacity);
        Ok(capacity::run(&self.context(), &self.config.capacity)
            .instrument(span)
            .await)
    }

    pub async fn run_size(&self) -> Result<ProbeReport, ProbeError> {
        let _guard = self.start_probe()?;
        let span = tracing::info_span!("probe", kind = ?ProbeKind::SingleSize);
        Ok(size::run(&self.context(), &self.config.size)
            .instrument(span)
            .await)
    }

    pub async fn run_count(&self) -> Result<ProbeReport, ProbeError> {
        let _guard = self.start_probe()?;
        let span = tracing::info_span!("probe", kind = ?ProbeKind::Count);
        Ok(count::run(&self.context(), &self.config.count)
            .instrument(span)
            .await)
    }

    /// Log usage, quota and persistence. `None` when the environment cannot
    /// report an estimate.
    pub async fn check_estimate(&self) -> Result<Option<StorageEstimate>, ProbeError> {
        let log = self.channel(Destination::Storage);
        let Some(env) = self.environment.as_deref() else {
            log.reset(
                "Storage estimates are not supported in this environment.",
                Severity::Warning,
            );
            return Ok(None);
        };
        let _guard = RunGuard::acquire(&self.running, self.sink.as_ref())?;
        log.reset("Checking current usage and quota...", Severity::Info);

        let estimate = match env.estimate().await {
            Ok(estimate) => estimate,
            Err(EnvironmentError::Unsupported) => {
                log.warning("Storage estimates are not supported in this environment.");
                return Ok(None);
            }
            Err(e) => {
                log.error(format!("Error getting the storage estimate: {e}"));
                return Err(ProbeError::Unexpected(e.to_string()));
            }
        };

        let mut usage = format!("Current usage: {}", format_bytes(estimate.usage));
        if let Some(details) = estimate.usage_details.as_ref().filter(|d| !d.is_empty()) {
            let parts: Vec<String> = details
                .iter()
                .map(|(name, bytes)| format!("{name}={}", format_bytes(*bytes)))
                .collect();
            usage.push_str(&format!(" (breakdown: {})", parts.join(", ")));
        }
        let quota = if estimate.quota == 0 {
            "unknown".to_string()
        } else {
            format_bytes(estimate.quota)
        };
        log.success(format!("{usage}\nQuota: {quota}"));

        match env.persisted().await {
            Ok(true) => log.success("Persistence: enabled"),
            Ok(false) => log.info("Persistence: disabled"),
            Err(EnvironmentError::Unsupported) => {
                log.warning("The persistence state is not supported in this environment.")
            }
            Err(e) => log.warning(format!("Could not read the persistence state: {e}")),
        }
        Ok(Some(estimate))
    }

    /// Request persistent storage if it is not already granted. Returns the
    /// state after the request, or `None` when unsupported.
    pub async fn request_persistence(&self) -> Result<Option<bool>, ProbeError> {
        let log = self.channel(Destination::Persist);
        let Some(env) = self.environment.as_deref() else {
            log.reset(
                "Persistent storage is not supported in this environment.",
                Severity::Warning,
            );
            return Ok(None);
        };
        let _guard = RunGuard::acquire(&self.running, self.sink.as_ref())?;
        log.reset(
            "Checking the persistent storage state and requesting it if needed...",
            Severity::Info,
        );
        match persistence_flow(env, &log).await {
            Ok(state) => Ok(Some(state)),
            Err(EnvironmentError::Unsupported) => {
                log.warning("Persistent storage is not supported in this environment.");
                Ok(None)
            }
            Err(e) => {
                log.error(format!("Persistence request or check failed: {e}"));
                Err(ProbeError::Unexpected(e.to_string()))
            }
        }
    }

    /// Stop any running probe, delete the database and refresh the estimate.
    ///
    /// If deletion fails for a reason other than other open connections,
    /// the three stores are cleared instead. The run flag is held for the
    /// deletion when the running probe stopped within the abort grace;
    /// otherwise the probe keeps the controls until it ends.
    pub async fn clear_all(&self) -> Result<(), ProbeError> {
        let log = self.channel(Destination::Clear);
        if self.is_running() {
            log.reset("Trying to stop the running test...", Severity::Warning);
            self.abort.request();
            tokio::time::sleep(self.config.abort_grace()).await;
        }
        let guard = match RunGuard::acquire(&self.running, self.sink.as_ref()) {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.abort.request();
                log.warning("Still waiting for the running test to stop; continuing anyway.");
                None
            }
        };

        log.reset("Deleting test data...", Severity::Info);
        let result = self.delete_or_clear(&log).await;
        drop(guard);

        if result.is_ok() && !self.is_running() {
            if let Err(e) = self.check_estimate().await {
                tracing::debug!(error = %e, "estimate refresh after clear failed");
            }
        }
        result
    }

    async fn delete_or_clear(&self, log: &Channel) -> Result<(), ProbeError> {
        match self.gateway.delete_database().await {
            Ok(()) => {
                log.success(format!(
                    "Deletion of database '{}' completed.",
                    self.gateway.database().name
                ));
                for destination in [
                    Destination::Capacity,
                    Destination::SingleSize,
                    Destination::Count,
                    Destination::Storage,
                    Destination::Persist,
                ] {
                    let area = self.channel(destination);
                    area.clear();
                    if destination.has_progress() {
                        area.set_progress(0, 0);
                    }
                }
                Ok(())
            }
            Err(e @ ProbeError::DeleteBlocked(_)) => {
                log.error(format!("Error while deleting test data: {e}"));
                Err(e)
            }
            Err(e) => {
                log.error(format!("Error while deleting test data: {e}"));
                log.warning("Database deletion failed; clearing the object stores instead...");
                match self
                    .gateway
                    .clear(&[CAPACITY_STORE, SIZE_STORE, COUNT_STORE])
                    .await
                {
                    Ok(()) => {
                        log.success("Cleared the object stores.");
                        Ok(())
                    }
                    Err(clear_err) => {
                        log.error(format!("Clearing the stores failed as well: {clear_err}"));
                        Err(clear_err)
                    }
                }
            }
        }
    }

    /// Signal a running probe to stop and close the connection.
    pub fn teardown(&self) {
        if self.is_running() {
            self.abort.request();
        }
        self.gateway.close();
    }

    fn start_probe(&self) -> Result<RunGuard<'_>, ProbeError> {
        let guard = RunGuard::acquire(&self.running, self.sink.as_ref())?;
        self.abort.reset();
        Ok(guard)
    }

    fn context(&self) -> ProbeContext<'_> {
        ProbeContext {
            gateway: &self.gateway,
            gate: &self.gate,
            abort: &self.abort,
            payloads: &self.payloads,
        }
    }

    fn channel(&self, destination: Destination) -> Channel {
        Channel::new(Arc::clone(&self.sink), destination)
    }
}

async fn persistence_flow(
    env: &dyn StorageEnvironment,
    log: &Channel,
) -> Result<bool, EnvironmentError> {
    let persisted = env.persisted().await?;
    log.info(format!(
        "Current persistence state: {}",
        if persisted { "enabled" } else { "disabled" }
    ));
    if persisted {
        log.info("Storage is already persistent; no request needed.");
        return Ok(true);
    }

    log.progress("Requesting persistent storage...");
    if env.persist().await? {
        log.success("The persistent storage request was granted.");
    } else {
        log.warning("The persistent storage request was not granted.");
        log.info("(Possible reasons: user refusal, low site engagement, insufficient space.)");
    }
    let after = env.persisted().await?;
    log.info(format!(
        "Persistence state after the request: {}",
        if after { "enabled" } else { "disabled" }
    ));
    Ok(after)
}
