//! Lazily opened, watched connection to the probe database.

use crate::errors::{BackendError, ProbeError};
use crate::sink::{Channel, Destination, EventSink, Severity};
use crate::storage::{Connection, ConnectionEvent, StorageBackend, StoreSpec};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub const CAPACITY_STORE: &str = "capacityStore";
pub const SIZE_STORE: &str = "sizeStore";
pub const COUNT_STORE: &str = "countStore";

/// The three probe stores. Only the count store generates its own keys.
pub fn default_schema() -> Vec<StoreSpec> {
    vec![
        StoreSpec::keyed(CAPACITY_STORE),
        StoreSpec::keyed(SIZE_STORE),
        StoreSpec::auto_increment(COUNT_STORE),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSpec {
    pub name: String,
    pub version: u32,
    pub schema: Vec<StoreSpec>,
}

impl Default for DatabaseSpec {
    fn default() -> Self {
        Self {
            name: "kvprobe".to_string(),
            version: 1,
            schema: default_schema(),
        }
    }
}

/// Current connection plus a generation counter, so a watcher for an old
/// connection never clears a newer one.
#[derive(Default)]
struct Slot {
    generation: u64,
    conn: Option<Arc<dyn Connection>>,
}

pub struct StorageGateway {
    backend: Arc<dyn StorageBackend>,
    spec: DatabaseSpec,
    sink: Arc<dyn EventSink>,
    slot: Arc<Mutex<Slot>>,
    pub(crate) delete_grace: Duration,
}

impl StorageGateway {
    pub const DEFAULT_DELETE_GRACE: Duration = Duration::from_millis(200);

    pub fn new(backend: Arc<dyn StorageBackend>, spec: DatabaseSpec, sink: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            spec,
            sink,
            slot: Arc::default(),
            delete_grace: Self::DEFAULT_DELETE_GRACE,
        }
    }

    pub fn with_delete_grace(mut self, grace: Duration) -> Self {
        self.delete_grace = grace;
        self
    }

    pub fn database(&self) -> &DatabaseSpec {
        &self.spec
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub(crate) fn channel(&self, destination: Destination) -> Channel {
        Channel::new(Arc::clone(&self.sink), destination)
    }

    /// The open connection, if any.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.slot().conn.clone()
    }

    /// Return the current connection, or open a fresh one.
    ///
    /// A connection is reused only while it is open, at the expected version
    /// and exposes at least one store.
    pub async fn open(&self) -> Result<Arc<dyn Connection>, ProbeError> {
        let stale = {
            let mut slot = self.slot();
            if let Some(conn) = &slot.conn {
                if !conn.is_closed()
                    && conn.version() == self.spec.version
                    && !conn.store_names().is_empty()
                {
                    return Ok(Arc::clone(conn));
                }
            }
            slot.generation += 1;
            slot.conn.take()
        };
        if let Some(stale) = stale {
            tracing::debug!("closing stale connection before reopening");
            stale.close();
        }

        tracing::debug!(database = %self.spec.name, version = self.spec.version, "opening database");
        let storage = self.channel(Destination::Storage);
        let opened = match self
            .backend
            .open(&self.spec.name, self.spec.version, &self.spec.schema)
            .await
        {
            Ok(opened) => opened,
            Err(BackendError::Blocked(detail)) => {
                storage.reset(
                    "Opening or upgrading the database was blocked. Close every other connection to it and retry.",
                    Severity::Error,
                );
                return Err(ProbeError::OpenBlocked(detail));
            }
            Err(e) => {
                storage.reset(format!("Database open error: {e}"), Severity::Error);
                return Err(ProbeError::OpenError(e.to_string()));
            }
        };

        if let Some(upgrade) = &opened.upgrade {
            let capacity = self.channel(Destination::Capacity);
            capacity.info("Updating database schema...");
            tracing::info!(
                from = upgrade.old_version,
                to = upgrade.new_version,
                created = ?upgrade.created_stores,
                "schema upgraded"
            );
            capacity.info("Database schema updated.");
        }

        let conn = opened.connection;
        let generation = {
            let mut slot = self.slot();
            slot.generation += 1;
            slot.conn = Some(Arc::clone(&conn));
            slot.generation
        };
        self.watch(&conn, generation);
        Ok(conn)
    }

    /// Close the current connection. Never fails.
    pub fn close(&self) {
        let conn = {
            let mut slot = self.slot();
            slot.generation += 1;
            slot.conn.take()
        };
        if let Some(conn) = conn {
            tracing::debug!(database = %self.spec.name, "closing connection");
            conn.close();
        }
    }

    fn watch(&self, conn: &Arc<dyn Connection>, generation: u64) {
        let mut events = conn.subscribe();
        let weak: Weak<dyn Connection> = Arc::downgrade(conn);
        let slot = Arc::clone(&self.slot);
        let storage = self.channel(Destination::Storage);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::VersionChange { old, new }) => {
                        tracing::warn!(old, ?new, "database version changed externally");
                        storage.reset(
                            "The database version was changed externally. Closing the connection; it reopens on the next operation.",
                            Severity::Warning,
                        );
                        clear_slot(&slot, generation);
                        if let Some(conn) = weak.upgrade() {
                            conn.close();
                        }
                    }
                    Ok(ConnectionEvent::Error(message)) => {
                        storage.error(format!("Database connection error: {message}"));
                    }
                    Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => {
                        clear_slot(&slot, generation);
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "connection events lagged");
                    }
                }
            }
        });
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clear_slot(slot: &Mutex<Slot>, generation: u64) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.generation == generation {
        slot.conn = None;
    }
}
