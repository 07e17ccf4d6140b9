//! Error taxonomy for probes, backends and configuration.
//!
//! Three layers:
//! - [`OpError`]: a single store operation (get/put/add/clear/commit) was rejected.
//! - [`BackendError`]: database-level failures (open, transaction start, delete).
//! - [`ProbeError`]: what callers of the gateway and the session see.

use thiserror::Error;

/// Rejection of one operation inside a transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpError {
    /// The backend's storage limit was hit. This is the "limit reached" signal.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("key already exists: {0}")]
    KeyExists(String),

    /// The backend refused the value (too large, wrong key type, read-only scope...).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("object store \"{0}\" not found")]
    StoreNotFound(String),

    /// The backend rolled the whole transaction back on its own.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("transaction is no longer active")]
    Inactive,

    #[error("backend failure: {0}")]
    Backend(String),
}

impl OpError {
    /// Stable error name, in the style of the storage engine's named errors.
    pub fn name(&self) -> &'static str {
        match self {
            OpError::QuotaExceeded(_) => "QuotaExceededError",
            OpError::KeyExists(_) => "ConstraintError",
            OpError::Rejected(_) => "DataError",
            OpError::StoreNotFound(_) => "NotFoundError",
            OpError::Aborted(_) => "AbortError",
            OpError::Inactive => "TransactionInactiveError",
            OpError::Backend(_) => "UnknownError",
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, OpError::QuotaExceeded(_))
    }
}

impl From<rusqlite::Error> for OpError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => OpError::QuotaExceeded(e.to_string()),
            Some(ErrorCode::TooBig) => OpError::Rejected(e.to_string()),
            Some(ErrorCode::ConstraintViolation) => OpError::KeyExists(e.to_string()),
            _ => OpError::Backend(e.to_string()),
        }
    }
}

/// Database-level failure reported by a [`crate::storage::StorageBackend`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Another connection prevents the open/upgrade/delete.
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("requested version {requested} is lower than the stored version {found}")]
    VersionMismatch { requested: u32, found: u32 },

    #[error("connection is closed")]
    Closed,

    #[error("object store \"{0}\" not found")]
    StoreNotFound(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        BackendError::Database(e.to_string())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

/// Errors surfaced by the gateway, the write primitives and the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("database open blocked: {0}")]
    OpenBlocked(String),

    #[error("database open failed: {0}")]
    OpenError(String),

    /// The whole transaction rolled back.
    #[error("transaction aborted in {store}: {cause}")]
    TransactionError { store: String, cause: OpError },

    /// The transaction committed, but some records were rejected individually.
    #[error("batch add completed with {failed} errors ({committed} records committed)")]
    PartialBatchFailure { failed: u64, committed: u64 },

    #[error("quota exceeded in {store}: {detail}")]
    QuotaExceeded { store: String, detail: String },

    #[error("database deletion blocked: {0}")]
    DeleteBlocked(String),

    /// The payload could not even be constructed.
    #[error("failed to create payload of {bytes} bytes: {detail}")]
    GenerationFailure { bytes: u64, detail: String },

    #[error("object store \"{0}\" not found")]
    StoreNotFound(String),

    #[error("a probe is already running")]
    RunInProgress,

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProbeError {
    /// Map an operation-level rejection to the caller-facing taxonomy.
    pub(crate) fn from_op(store: &str, cause: OpError) -> Self {
        match cause {
            OpError::QuotaExceeded(detail) => ProbeError::QuotaExceeded {
                store: store.to_string(),
                detail,
            },
            OpError::StoreNotFound(name) => ProbeError::StoreNotFound(name),
            cause => ProbeError::TransactionError {
                store: store.to_string(),
                cause,
            },
        }
    }

    /// Map a failure to start a transaction.
    pub(crate) fn from_backend(store: &str, err: BackendError) -> Self {
        match err {
            BackendError::StoreNotFound(name) => ProbeError::StoreNotFound(name),
            BackendError::Closed => ProbeError::TransactionError {
                store: store.to_string(),
                cause: OpError::Inactive,
            },
            other => ProbeError::Unexpected(other.to_string()),
        }
    }

    /// Stable error name used in human-readable probe messages.
    pub fn name(&self) -> &'static str {
        match self {
            ProbeError::OpenBlocked(_) => "OpenBlocked",
            ProbeError::OpenError(_) => "OpenError",
            ProbeError::TransactionError { cause, .. } => cause.name(),
            ProbeError::PartialBatchFailure { .. } => "PartialBatchFailure",
            ProbeError::QuotaExceeded { .. } => "QuotaExceededError",
            ProbeError::DeleteBlocked(_) => "DeleteBlocked",
            ProbeError::GenerationFailure { .. } => "GenerationFailure",
            ProbeError::StoreNotFound(_) => "NotFoundError",
            ProbeError::RunInProgress => "RunInProgress",
            ProbeError::Unexpected(_) => "Unexpected",
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ProbeError::QuotaExceeded { .. })
    }

    /// Errors that end a probe run outright instead of driving its search.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ProbeError::OpenBlocked(_)
                | ProbeError::OpenError(_)
                | ProbeError::StoreNotFound(_)
                | ProbeError::RunInProgress
        )
    }
}

/// Failure reported by a [`crate::environment::StorageEnvironment`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("not supported by this environment")]
    Unsupported,

    #[error("{0}")]
    Failed(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
