//! Host storage reporting: usage/quota estimate and persistence state.

use crate::errors::EnvironmentError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageEstimate {
    pub usage: u64,
    /// Zero when the environment does not report a quota.
    pub quota: u64,
    /// Per-store (or per-database) usage breakdown, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_details: Option<BTreeMap<String, u64>>,
}

#[async_trait]
pub trait StorageEnvironment: Send + Sync {
    async fn estimate(&self) -> Result<StorageEstimate, EnvironmentError>;

    /// Whether storage is currently protected from eviction.
    async fn persisted(&self) -> Result<bool, EnvironmentError>;

    /// Ask for persistence; returns whether it was granted.
    async fn persist(&self) -> Result<bool, EnvironmentError>;
}
