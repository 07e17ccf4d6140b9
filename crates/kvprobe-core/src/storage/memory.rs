//! In-process backend with configurable limits.
//!
//! Writes are staged per transaction and applied on commit. Limits are
//! checked per operation against committed data plus the transaction's own
//! staged writes, so a rejected record never reaches the store.

use super::{
    Connection, ConnectionEvent, Key, Opened, StorageBackend, StoreSpec, Transaction, TxMode,
    UpgradeInfo,
};
use crate::environment::{StorageEnvironment, StorageEstimate};
use crate::errors::{BackendError, EnvironmentError, OpError};
use crate::format::format_bytes;
use crate::payload::Payload;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Total bytes across every database of this backend.
    pub quota_bytes: Option<u64>,
    pub max_record_bytes: Option<u64>,
    /// Records per store.
    pub max_records: Option<u64>,
    /// Successful writes allowed in one transaction.
    pub max_ops_per_transaction: Option<u64>,
}

struct StoreData {
    auto_increment: bool,
    next_key: i64,
    records: BTreeMap<Key, Payload>,
    bytes: u64,
}

impl StoreData {
    fn new(auto_increment: bool) -> Self {
        Self {
            auto_increment,
            next_key: 1,
            records: BTreeMap::new(),
            bytes: 0,
        }
    }
}

struct Database {
    version: u32,
    stores: BTreeMap<String, StoreData>,
}

struct LiveConnection {
    database: String,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct State {
    databases: HashMap<String, Database>,
    connections: HashMap<u64, LiveConnection>,
    next_connection: u64,
    open_blocked: bool,
    persisted: bool,
    persist_grant: bool,
}

impl State {
    fn total_bytes(&self) -> u64 {
        self.databases
            .values()
            .flat_map(|db| db.stores.values())
            .map(|s| s.bytes)
            .sum()
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    limits: MemoryLimits,
}

impl MemoryBackend {
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            state: Arc::default(),
            limits,
        }
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    /// Simulate another context holding the database open during an upgrade.
    pub fn set_open_blocked(&self, blocked: bool) {
        self.lock().open_blocked = blocked;
    }

    /// Whether a later `persist()` request is granted.
    pub fn set_persist_grant(&self, grant: bool) {
        self.lock().persist_grant = grant;
    }

    pub fn record_count(&self, database: &str, store: &str) -> usize {
        self.lock()
            .databases
            .get(database)
            .and_then(|db| db.stores.get(store))
            .map(|s| s.records.len())
            .unwrap_or(0)
    }

    pub fn record(&self, database: &str, store: &str, key: &Key) -> Option<Payload> {
        self.lock()
            .databases
            .get(database)
            .and_then(|db| db.stores.get(store))
            .and_then(|s| s.records.get(key).cloned())
    }

    pub fn database_exists(&self, database: &str) -> bool {
        self.lock().databases.contains_key(database)
    }

    pub fn open_connections(&self, database: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.database == database)
            .count()
    }

    /// Notify every open connection that another context bumped the version.
    pub fn simulate_version_change(&self, database: &str) {
        let state = self.lock();
        let old = state
            .databases
            .get(database)
            .map(|db| db.version)
            .unwrap_or(0);
        for conn in state.connections.values().filter(|c| c.database == database) {
            let _ = conn.events.send(ConnectionEvent::VersionChange {
                old,
                new: Some(old + 1),
            });
        }
    }

    pub fn simulate_connection_error(&self, database: &str, message: &str) {
        let state = self.lock();
        for conn in state.connections.values().filter(|c| c.database == database) {
            let _ = conn.events.send(ConnectionEvent::Error(message.to_string()));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open(
        &self,
        name: &str,
        version: u32,
        schema: &[StoreSpec],
    ) -> Result<Opened, BackendError> {
        let mut state = self.lock();
        if state.open_blocked {
            return Err(BackendError::Blocked(format!(
                "another connection keeps {name} open"
            )));
        }

        let (stores, upgrade) = {
            let db = state
                .databases
                .entry(name.to_string())
                .or_insert_with(|| Database {
                    version: 0,
                    stores: BTreeMap::new(),
                });
            if version < db.version {
                return Err(BackendError::VersionMismatch {
                    requested: version,
                    found: db.version,
                });
            }
            let mut upgrade = None;
            if version > db.version {
                let mut created = Vec::new();
                for spec in schema {
                    if !db.stores.contains_key(&spec.name) {
                        db.stores
                            .insert(spec.name.clone(), StoreData::new(spec.auto_increment));
                        created.push(spec.name.clone());
                    }
                }
                upgrade = Some(UpgradeInfo {
                    old_version: db.version,
                    new_version: version,
                    created_stores: created,
                });
                db.version = version;
            }
            (db.stores.keys().cloned().collect::<Vec<_>>(), upgrade)
        };

        let id = state.next_connection;
        state.next_connection += 1;
        let (events, _) = broadcast::channel(16);
        state.connections.insert(
            id,
            LiveConnection {
                database: name.to_string(),
                events: events.clone(),
            },
        );
        drop(state);

        Ok(Opened {
            connection: Arc::new(MemoryConnection {
                id,
                name: name.to_string(),
                version,
                stores,
                backend: self.clone(),
                events,
                closed: Arc::new(AtomicBool::new(false)),
            }),
            upgrade,
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        let open = state
            .connections
            .values()
            .filter(|c| c.database == name)
            .count();
        if open > 0 {
            return Err(BackendError::Blocked(format!(
                "{open} connection(s) to {name} still open"
            )));
        }
        state.databases.remove(name);
        Ok(())
    }
}

#[async_trait]
impl StorageEnvironment for MemoryBackend {
    async fn estimate(&self) -> Result<StorageEstimate, EnvironmentError> {
        let state = self.lock();
        let mut details = BTreeMap::new();
        for db in state.databases.values() {
            for (name, store) in &db.stores {
                *details.entry(name.clone()).or_insert(0) += store.bytes;
            }
        }
        Ok(StorageEstimate {
            usage: state.total_bytes(),
            quota: self.limits.quota_bytes.unwrap_or(0),
            usage_details: Some(details),
        })
    }

    async fn persisted(&self) -> Result<bool, EnvironmentError> {
        Ok(self.lock().persisted)
    }

    async fn persist(&self) -> Result<bool, EnvironmentError> {
        let mut state = self.lock();
        if state.persist_grant {
            state.persisted = true;
        }
        Ok(state.persisted)
    }
}

pub struct MemoryConnection {
    id: u64,
    name: String,
    version: u32,
    stores: Vec<String>,
    backend: MemoryBackend,
    events: broadcast::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.lock().connections.remove(&self.id);
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn transaction(
        &self,
        stores: &[&str],
        mode: TxMode,
    ) -> Result<Box<dyn Transaction>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        for store in stores {
            if !self.stores.iter().any(|s| s == store) {
                return Err(BackendError::StoreNotFound(store.to_string()));
            }
        }
        Ok(Box::new(MemoryTransaction {
            backend: self.backend.clone(),
            database: self.name.clone(),
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            closed: Arc::clone(&self.closed),
            overlays: HashMap::new(),
            ops: 0,
        }))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Staged changes to one store, relative to its committed contents.
#[derive(Default)]
struct Overlay {
    cleared: bool,
    puts: BTreeMap<Key, Payload>,
    bytes_delta: i64,
    records_delta: i64,
    next_key: Option<i64>,
}

pub struct MemoryTransaction {
    backend: MemoryBackend,
    database: String,
    scope: Vec<String>,
    mode: TxMode,
    closed: Arc<AtomicBool>,
    overlays: HashMap<String, Overlay>,
    ops: u64,
}

impl MemoryTransaction {
    fn check(&self, store: &str, write: bool) -> Result<(), OpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpError::Inactive);
        }
        if !self.scope.iter().any(|s| s == store) {
            return Err(OpError::StoreNotFound(store.to_string()));
        }
        if write && self.mode == TxMode::ReadOnly {
            return Err(OpError::Rejected(
                "write in a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn write(
        &mut self,
        store: &str,
        key: Option<Key>,
        value: Payload,
        must_be_new: bool,
    ) -> Result<Key, OpError> {
        self.check(store, true)?;
        let limits = self.backend.limits.clone();
        if let Some(max) = limits.max_ops_per_transaction {
            if self.ops >= max {
                return Err(OpError::Rejected(format!(
                    "transaction operation limit of {max} reached"
                )));
            }
        }
        let new_len = value.len() as u64;
        if let Some(max) = limits.max_record_bytes {
            if new_len > max {
                return Err(OpError::Rejected(format!(
                    "record of {} exceeds the record limit of {}",
                    format_bytes(new_len),
                    format_bytes(max)
                )));
            }
        }

        let staged_bytes: i64 = self.overlays.values().map(|o| o.bytes_delta).sum();
        let state = self.backend.lock();
        let data = state
            .databases
            .get(&self.database)
            .and_then(|db| db.stores.get(store))
            .ok_or_else(|| OpError::StoreNotFound(store.to_string()))?;
        let overlay = self.overlays.entry(store.to_string()).or_default();

        let (key, generated) = match key {
            Some(k) => (k, None),
            None if data.auto_increment => {
                let next = overlay.next_key.unwrap_or(data.next_key);
                (Key::Int(next), Some(next + 1))
            }
            None => {
                return Err(OpError::Rejected(format!(
                    "store {store} requires an explicit key"
                )))
            }
        };

        let old_len = overlay.puts.get(&key).map(|p| p.len() as u64).or_else(|| {
            if overlay.cleared {
                None
            } else {
                data.records.get(&key).map(|p| p.len() as u64)
            }
        });
        if must_be_new && old_len.is_some() {
            return Err(OpError::KeyExists(key.to_string()));
        }

        let bytes_change = new_len as i64 - old_len.unwrap_or(0) as i64;
        if let Some(quota) = limits.quota_bytes {
            let projected = state.total_bytes() as i64 + staged_bytes + bytes_change;
            if projected > quota as i64 {
                return Err(OpError::QuotaExceeded(format!(
                    "storing {} would exceed the quota of {}",
                    format_bytes(new_len),
                    format_bytes(quota)
                )));
            }
        }
        if let Some(max) = limits.max_records {
            let visible = data.records.len() as i64 + overlay.records_delta;
            if old_len.is_none() && visible + 1 > max as i64 {
                return Err(OpError::QuotaExceeded(format!(
                    "store {store} already holds the maximum of {max} records"
                )));
            }
        }

        let next_after_explicit = match (&key, data.auto_increment) {
            (Key::Int(i), true) if *i >= overlay.next_key.unwrap_or(data.next_key) => {
                Some(i + 1)
            }
            _ => None,
        };
        if let Some(next) = generated.or(next_after_explicit) {
            overlay.next_key = Some(next);
        }
        overlay.bytes_delta += bytes_change;
        if old_len.is_none() {
            overlay.records_delta += 1;
        }
        overlay.puts.insert(key.clone(), value);
        self.ops += 1;
        Ok(key)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, store: &str, key: &Key) -> Result<Option<Payload>, OpError> {
        self.check(store, false)?;
        if let Some(overlay) = self.overlays.get(store) {
            if let Some(v) = overlay.puts.get(key) {
                return Ok(Some(v.clone()));
            }
            if overlay.cleared {
                return Ok(None);
            }
        }
        let state = self.backend.lock();
        Ok(state
            .databases
            .get(&self.database)
            .and_then(|db| db.stores.get(store))
            .and_then(|s| s.records.get(key).cloned()))
    }

    async fn put(&mut self, store: &str, key: Key, value: Payload) -> Result<(), OpError> {
        self.write(store, Some(key), value, false).map(|_| ())
    }

    async fn add(
        &mut self,
        store: &str,
        key: Option<Key>,
        value: Payload,
    ) -> Result<Key, OpError> {
        self.write(store, key, value, true)
    }

    async fn clear(&mut self, store: &str) -> Result<(), OpError> {
        self.check(store, true)?;
        let state = self.backend.lock();
        let data = state
            .databases
            .get(&self.database)
            .and_then(|db| db.stores.get(store))
            .ok_or_else(|| OpError::StoreNotFound(store.to_string()))?;
        let overlay = self.overlays.entry(store.to_string()).or_default();
        overlay.cleared = true;
        overlay.puts.clear();
        overlay.bytes_delta = -(data.bytes as i64);
        overlay.records_delta = -(data.records.len() as i64);
        Ok(())
    }

    fn is_aborted(&self) -> bool {
        false
    }

    async fn commit(self: Box<Self>) -> Result<(), OpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpError::Aborted(
                "connection closed before commit".to_string(),
            ));
        }
        let mut state = self.backend.lock();
        let db = state
            .databases
            .get_mut(&self.database)
            .ok_or_else(|| OpError::Aborted("database was deleted".to_string()))?;
        let MemoryTransaction { overlays, .. } = *self;
        for (name, overlay) in overlays {
            let Some(store) = db.stores.get_mut(&name) else {
                continue;
            };
            if overlay.cleared {
                store.records.clear();
                store.bytes = 0;
            }
            for (key, value) in overlay.puts {
                store.bytes += value.len() as u64;
                if let Some(old) = store.records.insert(key, value) {
                    store.bytes -= old.len() as u64;
                }
            }
            if let Some(next) = overlay.next_key {
                store.next_key = store.next_key.max(next);
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}
