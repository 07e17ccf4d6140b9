//! Adaptive probing engine for the practical limits of a transactional
//! key-value store: total capacity, largest single record, record count.
//!
//! ```text
//! ┌──────────────────────────── ProbeSession ────────────────────────────┐
//! │  CapacityProber   SizeProber   CountProber        TrialGate ◀─ Confirmer
//! │         │              │             │                                │
//! │         └──────────────┼─────────────┘            EventSink (logs,   │
//! │                        ▼                           progress, controls)│
//! │                 StorageGateway ── writes (put/add/batch_add/clear)    │
//! └────────────────────────┼─────────────────────────────────────────────┘
//!                          ▼
//!          StorageBackend (memory | sqlite) + StorageEnvironment
//! ```

pub mod config;
pub mod environment;
pub mod errors;
pub mod format;
pub mod gate;
pub mod gateway;
pub mod payload;
pub mod probe;
pub mod session;
pub mod sink;
pub mod storage;
mod writes;

pub use config::{
    BackendConfig, BackendKind, BuiltBackend, CapacityConfig, CountConfig, DatabaseConfig,
    GateConfig, ProbeConfig, SizeConfig,
};
pub use environment::{StorageEnvironment, StorageEstimate};
pub use errors::{BackendError, ConfigError, EnvironmentError, OpError, ProbeError};
pub use gate::{AlwaysContinue, Confirmer, NeverContinue, ScriptedConfirmer, TrialGate, TrialPrompt};
pub use gateway::{
    default_schema, DatabaseSpec, StorageGateway, CAPACITY_STORE, COUNT_STORE, SIZE_STORE,
};
pub use payload::{Payload, PayloadFactory};
pub use probe::{Outcome, Phase, ProbeContext, ProbeKind, ProbeReport, ProbeState};
pub use session::{AbortFlag, ProbeSession};
pub use sink::{
    Channel, Destination, EventSink, LogEvent, ProgressUpdate, RecordingSink, Severity,
};
pub use storage::{
    Key, MemoryBackend, MemoryLimits, SqliteBackend, SqliteOptions, StorageBackend, StoreSpec,
};

/// One mebibyte, the default probe unit.
pub const MIB: u64 = 1024 * 1024;
