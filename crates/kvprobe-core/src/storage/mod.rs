//! Contract the probing engine requires from the backing key-value store.
//!
//! The engine never talks to a concrete engine directly: it opens a
//! [`Connection`] through a [`StorageBackend`], runs single-scope
//! [`Transaction`]s against named stores and listens for
//! [`ConnectionEvent`]s. Two backends ship with the crate:
//! - [`memory::MemoryBackend`]: in-process, quota-enforcing, used for simulation and tests
//! - [`sqlite::SqliteBackend`]: one SQLite file per database, limits enforced by SQLite itself

pub mod memory;
pub mod sqlite;

use crate::errors::{BackendError, OpError};
use crate::payload::Payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use memory::{MemoryBackend, MemoryLimits};
pub use sqlite::{SqliteBackend, SqliteOptions};

/// Record key: explicit text keys or auto-generated integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

/// Declaration of one store in the database schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
    pub name: String,
    /// Keys are generated by the backend when none is supplied.
    pub auto_increment: bool,
}

impl StoreSpec {
    pub fn keyed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_increment: false,
        }
    }

    pub fn auto_increment(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_increment: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Lifecycle events a connection emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Another context changed (or deleted, `new: None`) the database version.
    VersionChange { old: u32, new: Option<u32> },
    /// Connection-level error not tied to a caller's transaction.
    Error(String),
    Closed,
}

/// Schema upgrade performed while opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeInfo {
    pub old_version: u32,
    pub new_version: u32,
    pub created_stores: Vec<String>,
}

pub struct Opened {
    pub connection: Arc<dyn Connection>,
    pub upgrade: Option<UpgradeInfo>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open `name` at `version`, creating missing stores from `schema` when
    /// the stored version is lower.
    async fn open(
        &self,
        name: &str,
        version: u32,
        schema: &[StoreSpec],
    ) -> Result<Opened, BackendError>;

    /// Delete the whole database. Fails with [`BackendError::Blocked`] while
    /// connections to it remain open.
    async fn delete_database(&self, name: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn store_names(&self) -> Vec<String>;

    fn contains_store(&self, store: &str) -> bool {
        self.store_names().iter().any(|s| s == store)
    }

    fn is_closed(&self) -> bool;

    /// Best-effort close; never fails. Emits [`ConnectionEvent::Closed`].
    fn close(&self);

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn transaction(
        &self,
        stores: &[&str],
        mode: TxMode,
    ) -> Result<Box<dyn Transaction>, BackendError>;
}

/// One unit of work over a fixed set of stores.
///
/// A rejected operation leaves the transaction usable unless the backend
/// rolled it back on its own ([`Transaction::is_aborted`]). Whether a
/// rejection should abort the unit is the caller's decision.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, store: &str, key: &Key) -> Result<Option<Payload>, OpError>;

    /// Insert or overwrite.
    async fn put(&mut self, store: &str, key: Key, value: Payload) -> Result<(), OpError>;

    /// Insert under a fresh key: `key` for keyed stores, generated otherwise.
    async fn add(&mut self, store: &str, key: Option<Key>, value: Payload)
        -> Result<Key, OpError>;

    async fn clear(&mut self, store: &str) -> Result<(), OpError>;

    fn is_aborted(&self) -> bool;

    async fn commit(self: Box<Self>) -> Result<(), OpError>;

    async fn abort(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_display_plainly() {
        assert_eq!(Key::from(42).to_string(), "42");
        assert_eq!(Key::from("single_item_test_key").to_string(), "single_item_test_key");
    }

    #[test]
    fn keys_serialize_untagged() {
        assert_eq!(serde_json::to_string(&Key::Int(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&Key::from("k")).unwrap(), "\"k\"");
    }
}
