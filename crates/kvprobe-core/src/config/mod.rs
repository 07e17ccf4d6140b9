//! Probe configuration (`kvprobe.yaml`).
//!
//! Every section is optional; missing fields fall back to the defaults
//! below. Sizes are expressed in units of `unit_bytes` (1 MiB unless
//! overridden), so `chunk_mb: 10` means ten units.

use crate::environment::StorageEnvironment;
use crate::errors::ConfigError;
use crate::gateway::{default_schema, DatabaseSpec};
use crate::payload::PayloadFactory;
use crate::storage::{MemoryBackend, MemoryLimits, SqliteBackend, SqliteOptions, StorageBackend};
use crate::MIB;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    pub capacity: CapacityConfig,
    pub size: SizeConfig,
    pub count: CountConfig,
    pub gate: GateConfig,
    /// Wait between closing the connection and deleting the database.
    pub delete_grace_ms: u64,
    /// Wait after signalling a running probe to stop, before clearing.
    pub abort_grace_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            backend: BackendConfig::default(),
            capacity: CapacityConfig::default(),
            size: SizeConfig::default(),
            count: CountConfig::default(),
            gate: GateConfig::default(),
            delete_grace_ms: 200,
            abort_grace_ms: 200,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub name: String,
    pub version: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "kvprobe".to_string(),
            version: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Directory holding the SQLite files.
    pub dir: PathBuf,
    pub quota_bytes: Option<u64>,
    pub max_record_bytes: Option<u64>,
    /// Memory backend only.
    pub max_records: Option<u64>,
    /// Memory backend only.
    pub max_ops_per_transaction: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            dir: PathBuf::from(".kvprobe"),
            quota_bytes: None,
            max_record_bytes: None,
            max_records: None,
            max_ops_per_transaction: None,
        }
    }
}

/// A backend and the environment reporting on it.
pub struct BuiltBackend {
    pub backend: Arc<dyn StorageBackend>,
    pub environment: Arc<dyn StorageEnvironment>,
}

impl BackendConfig {
    pub fn build(&self) -> BuiltBackend {
        match self.kind {
            BackendKind::Memory => {
                let memory = MemoryBackend::new(MemoryLimits {
                    quota_bytes: self.quota_bytes,
                    max_record_bytes: self.max_record_bytes,
                    max_records: self.max_records,
                    max_ops_per_transaction: self.max_ops_per_transaction,
                });
                BuiltBackend {
                    backend: Arc::new(memory.clone()),
                    environment: Arc::new(memory),
                }
            }
            BackendKind::Sqlite => {
                let sqlite = SqliteBackend::new(SqliteOptions {
                    dir: self.dir.clone(),
                    quota_bytes: self.quota_bytes,
                    max_record_bytes: self.max_record_bytes,
                });
                BuiltBackend {
                    backend: Arc::new(sqlite.clone()),
                    environment: Arc::new(sqlite),
                }
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CapacityConfig {
    pub chunk_mb: u64,
    pub target_mb: u64,
    pub unit_bytes: u64,
    pub trial_frequency: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            chunk_mb: 10,
            target_mb: 3072,
            unit_bytes: MIB,
            trial_frequency: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SizeConfig {
    pub target_mb: u64,
    pub precision_mb: u64,
    pub unit_bytes: u64,
    pub trial_frequency: u64,
    /// Largest payload ever generated; defaults to 1 GiB.
    pub max_payload_mb: Option<u64>,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            target_mb: 300,
            precision_mb: 1,
            unit_bytes: MIB,
            trial_frequency: 10,
            max_payload_mb: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CountConfig {
    pub target: u64,
    pub initial_batch: u64,
    pub batch_growth: u64,
    pub max_batch: u64,
    /// Single mode stops once the count exceeds `target * safety_multiple`.
    pub safety_multiple: u64,
    /// Zero disables the trial gate for this probe.
    pub trial_frequency: u64,
    pub log_every: u64,
    /// Stop in single mode as soon as the target is reached.
    pub stop_at_target: bool,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            target: 10_000,
            initial_batch: 100,
            batch_growth: 10,
            max_batch: 500_000,
            safety_multiple: 10,
            trial_frequency: 0,
            log_every: 500,
            stop_at_target: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    pub pause_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { pause_ms: 100 }
    }
}

impl ProbeConfig {
    pub const DEFAULT_PATH: &'static str = "kvprobe.yaml";

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text, &path.display().to_string())
    }

    /// Like [`ProbeConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        // An empty document means "all defaults".
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.name.is_empty() {
            return Err(ConfigError::Invalid("database.name must not be empty".into()));
        }
        let positive = [
            ("database.version", u64::from(self.database.version)),
            ("capacity.chunk_mb", self.capacity.chunk_mb),
            ("capacity.target_mb", self.capacity.target_mb),
            ("capacity.unit_bytes", self.capacity.unit_bytes),
            ("size.target_mb", self.size.target_mb),
            ("size.precision_mb", self.size.precision_mb),
            ("size.unit_bytes", self.size.unit_bytes),
            ("count.target", self.count.target),
            ("count.initial_batch", self.count.initial_batch),
            ("count.batch_growth", self.count.batch_growth),
            ("count.max_batch", self.count.max_batch),
            ("count.safety_multiple", self.count.safety_multiple),
            ("count.log_every", self.count.log_every),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
        }
        if self.size.max_payload_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "size.max_payload_mb must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn database_spec(&self) -> DatabaseSpec {
        DatabaseSpec {
            name: self.database.name.clone(),
            version: self.database.version,
            schema: default_schema(),
        }
    }

    pub fn payload_factory(&self) -> PayloadFactory {
        match self.size.max_payload_mb {
            Some(units) => PayloadFactory::new(units.saturating_mul(self.size.unit_bytes)),
            None => PayloadFactory::default(),
        }
    }

    pub fn gate_pause(&self) -> Duration {
        Duration::from_millis(self.gate.pause_ms)
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_millis(self.delete_grace_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}
