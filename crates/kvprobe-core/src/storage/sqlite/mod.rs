//! SQLite backend: one database file per probe database.
//!
//! Limits are enforced by SQLite itself: `max_page_count` for the quota
//! (per database file) and `SQLITE_LIMIT_LENGTH` for single records. The
//! database version lives in `PRAGMA user_version`.

mod schema;
mod txn;

pub use txn::SqliteTransaction;

use super::{Connection, ConnectionEvent, Key, Opened, StorageBackend, StoreSpec, Transaction, TxMode};
use crate::environment::{StorageEnvironment, StorageEstimate};
use crate::errors::{BackendError, EnvironmentError};
use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

pub(crate) type SharedConn = Arc<Mutex<Option<rusqlite::Connection>>>;

const FILE_EXTENSION: &str = "sqlite3";
const PERSIST_MARKER: &str = ".persisted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    pub dir: PathBuf,
    /// Per database file, rounded down to whole pages.
    pub quota_bytes: Option<u64>,
    pub max_record_bytes: Option<u64>,
}

impl SqliteOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes: None,
            max_record_bytes: None,
        }
    }
}

struct Registered {
    database: String,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Clone)]
pub struct SqliteBackend {
    options: SqliteOptions,
    live: Arc<Mutex<HashMap<u64, Registered>>>,
    next_id: Arc<AtomicU64>,
}

impl SqliteBackend {
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            live: Arc::default(),
            next_id: Arc::default(),
        }
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.options.dir.join(format!("{name}.{FILE_EXTENSION}"))
    }

    fn live(&self) -> MutexGuard<'_, HashMap<u64, Registered>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_sync(
        &self,
        name: &str,
        version: u32,
        schema_specs: &[StoreSpec],
    ) -> Result<(rusqlite::Connection, BTreeMap<String, bool>, Option<super::UpgradeInfo>), BackendError>
    {
        schema::validate_name("database", name)?;
        for spec in schema_specs {
            schema::validate_name("store", &spec.name)?;
        }
        std::fs::create_dir_all(&self.options.dir)?;
        let conn = rusqlite::Connection::open(self.database_path(name))?;
        schema::init_connection(&conn, &self.options)?;

        let stored = schema::stored_version(&conn)?;
        if version < stored {
            return Err(BackendError::VersionMismatch {
                requested: version,
                found: stored,
            });
        }
        let mut upgrade = None;
        if version > stored {
            let others: Vec<_> = self
                .live()
                .values()
                .filter(|r| r.database == name)
                .map(|r| r.events.clone())
                .collect();
            if !others.is_empty() {
                for events in &others {
                    let _ = events.send(ConnectionEvent::VersionChange {
                        old: stored,
                        new: Some(version),
                    });
                }
                return Err(BackendError::Blocked(format!(
                    "{} open connection(s) to {name} prevent the upgrade to version {version}",
                    others.len()
                )));
            }
            upgrade = Some(schema::upgrade(&conn, stored, version, schema_specs)?);
        }
        let stores = schema::list_stores(&conn)?;
        schema::apply_record_limit(&conn, &self.options);
        Ok((conn, stores, upgrade))
    }

    fn remove_files(&self, name: &str) -> Result<(), BackendError> {
        let base = self.database_path(name);
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let mut path = base.clone().into_os_string();
            path.push(suffix);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn open(
        &self,
        name: &str,
        version: u32,
        schema: &[StoreSpec],
    ) -> Result<Opened, BackendError> {
        let (conn, stores, upgrade) = self.open_sync(name, version, schema)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(16);
        self.live().insert(
            id,
            Registered {
                database: name.to_string(),
                events: events.clone(),
            },
        );
        tracing::debug!(database = name, version, id, "sqlite connection opened");
        Ok(Opened {
            connection: Arc::new(SqliteConnection {
                id,
                name: name.to_string(),
                version,
                stores,
                conn: Arc::new(Mutex::new(Some(conn))),
                backend: self.clone(),
                events,
                closed: AtomicBool::new(false),
            }),
            upgrade,
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), BackendError> {
        schema::validate_name("database", name)?;
        let open = self.live().values().filter(|r| r.database == name).count();
        if open > 0 {
            return Err(BackendError::Blocked(format!(
                "{open} connection(s) to {name} still open"
            )));
        }
        self.remove_files(name)
    }
}

#[async_trait]
impl StorageEnvironment for SqliteBackend {
    async fn estimate(&self) -> Result<StorageEstimate, EnvironmentError> {
        let mut details = BTreeMap::new();
        let mut usage = 0;
        let entries = match std::fs::read_dir(&self.options.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StorageEstimate {
                    usage: 0,
                    quota: self.options.quota_bytes.unwrap_or(0),
                    usage_details: Some(details),
                })
            }
            Err(e) => return Err(EnvironmentError::Failed(e.to_string())),
        };
        for entry in entries {
            let entry = entry.map_err(|e| EnvironmentError::Failed(e.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(database) = database_of(&file_name) else {
                continue;
            };
            let len = entry
                .metadata()
                .map_err(|e| EnvironmentError::Failed(e.to_string()))?
                .len();
            usage += len;
            *details.entry(database.to_string()).or_insert(0) += len;
        }
        Ok(StorageEstimate {
            usage,
            quota: self.options.quota_bytes.unwrap_or(0),
            usage_details: Some(details),
        })
    }

    async fn persisted(&self) -> Result<bool, EnvironmentError> {
        Ok(self.options.dir.join(PERSIST_MARKER).exists())
    }

    async fn persist(&self) -> Result<bool, EnvironmentError> {
        std::fs::create_dir_all(&self.options.dir)
            .and_then(|()| std::fs::write(self.options.dir.join(PERSIST_MARKER), b""))
            .map_err(|e| EnvironmentError::Failed(e.to_string()))?;
        Ok(true)
    }
}

/// Database name for a data or journal file in the backend directory.
fn database_of(file_name: &str) -> Option<&str> {
    let ext = format!(".{FILE_EXTENSION}");
    let stem_end = file_name.find(&ext)?;
    let rest = &file_name[stem_end + ext.len()..];
    matches!(rest, "" | "-journal" | "-wal" | "-shm").then(|| &file_name[..stem_end])
}

pub struct SqliteConnection {
    id: u64,
    name: String,
    version: u32,
    stores: BTreeMap<String, bool>,
    conn: SharedConn,
    backend: SqliteBackend,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for SqliteConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(database = %self.name, error = %e, "sqlite close failed");
            }
        }
        self.backend.live().remove(&self.id);
        let _ = self.events.send(ConnectionEvent::Closed);
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
        let mut scope = BTreeMap::new();
        for store in stores {
            let auto = self
                .stores
                .get(*store)
                .ok_or_else(|| BackendError::StoreNotFound(store.to_string()))?;
            scope.insert(store.to_string(), *auto);
        }
        let tx = SqliteTransaction::begin(Arc::clone(&self.conn), scope, mode)
            .map_err(|e| BackendError::Database(e.to_string()))?;
        Ok(Box::new(tx))
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Key::Int(i) => ToSqlOutput::from(*i),
            Key::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(Key::Int(i)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| Key::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use tempfile::tempdir;

    fn schema() -> Vec<StoreSpec> {
        vec![StoreSpec::keyed("kv"), StoreSpec::auto_increment("auto")]
    }

    #[tokio::test]
    async fn open_creates_stores_and_reopens_without_upgrade() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(SqliteOptions::new(dir.path()));
        let opened = backend.open("probe", 1, &schema()).await.unwrap();
        let upgrade = opened.upgrade.clone().unwrap();
        assert_eq!(upgrade.created_stores.len(), 2);
        assert!(opened.connection.contains_store("auto"));
        opened.connection.close();

        let again = backend.open("probe", 1, &schema()).await.unwrap();
        assert!(again.upgrade.is_none());
        assert_eq!(again.connection.store_names(), vec!["auto", "kv"]);
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(SqliteOptions::new(dir.path()));
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        let mut tx = conn.transaction(&["kv", "auto"], TxMode::ReadWrite).await.unwrap();
        tx.put("kv", Key::from("a"), Payload::from("hello")).await.unwrap();
        let generated = tx.add("auto", None, Payload::from("x")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(generated, Key::Int(1));
        conn.close();

        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        let mut tx = conn.transaction(&["kv"], TxMode::ReadOnly).await.unwrap();
        let value = tx.get("kv", &Key::from("a")).await.unwrap().unwrap();
        assert_eq!(value.as_bytes(), b"hello");
    }

    #[tokio::test]
    async fn rejected_op_keeps_transaction_usable() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(SqliteOptions::new(dir.path()));
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        let mut tx = conn.transaction(&["kv"], TxMode::ReadWrite).await.unwrap();
        tx.add("kv", Some(Key::from("a")), Payload::from("1")).await.unwrap();
        let err = tx
            .add("kv", Some(Key::from("a")), Payload::from("2"))
            .await
            .unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
        assert!(!tx.is_aborted());
        tx.add("kv", Some(Key::from("b")), Payload::from("3")).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn record_limit_rejects_large_values() {
        let dir = tempdir().unwrap();
        let mut options = SqliteOptions::new(dir.path());
        options.max_record_bytes = Some(1000);
        let backend = SqliteBackend::new(options);
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        let mut tx = conn.transaction(&["kv"], TxMode::ReadWrite).await.unwrap();
        tx.put("kv", Key::from("ok"), Payload::from(vec![b'a'; 900]))
            .await
            .unwrap();
        let err = tx
            .put("kv", Key::from("big"), Payload::from(vec![b'a'; 2000]))
            .await
            .unwrap_err();
        assert_eq!(err.name(), "DataError");
    }

    #[tokio::test]
    async fn quota_surfaces_as_quota_exceeded() {
        let dir = tempdir().unwrap();
        let mut options = SqliteOptions::new(dir.path());
        options.quota_bytes = Some(64 * 1024);
        let backend = SqliteBackend::new(options);
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        let mut hit_quota = false;
        for i in 0..64 {
            let mut tx = conn.transaction(&["kv"], TxMode::ReadWrite).await.unwrap();
            match tx
                .put("kv", Key::from(format!("k{i}")), Payload::from(vec![b'a'; 8 * 1024]))
                .await
            {
                Ok(()) => tx.commit().await.unwrap(),
                Err(e) => {
                    assert!(e.is_quota(), "unexpected error: {e}");
                    hit_quota = true;
                    break;
                }
            }
        }
        assert!(hit_quota);
    }

    #[tokio::test]
    async fn delete_blocked_while_open_then_removes_files() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(SqliteOptions::new(dir.path()));
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        assert!(matches!(
            backend.delete_database("probe").await,
            Err(BackendError::Blocked(_))
        ));
        conn.close();
        backend.delete_database("probe").await.unwrap();
        assert!(!backend.database_path("probe").exists());
    }

    #[tokio::test]
    async fn upgrade_with_open_connection_is_blocked_and_notifies() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(SqliteOptions::new(dir.path()));
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        let mut events = conn.subscribe();
        assert!(matches!(
            backend.open("probe", 2, &schema()).await,
            Err(BackendError::Blocked(_))
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::VersionChange {
                old: 1,
                new: Some(2)
            }
        );
    }

    #[tokio::test]
    async fn estimate_reports_files_and_persistence() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::new(SqliteOptions::new(dir.path()));
        let conn = backend.open("probe", 1, &schema()).await.unwrap().connection;
        conn.close();
        let estimate = backend.estimate().await.unwrap();
        assert!(estimate.usage > 0);
        assert!(estimate.usage_details.unwrap().contains_key("probe"));
        assert!(!backend.persisted().await.unwrap());
        assert!(backend.persist().await.unwrap());
        assert!(backend.persisted().await.unwrap());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(schema::validate_name("store", "ok_name-1").is_ok());
        assert!(schema::validate_name("store", "bad\"name").is_err());
        assert!(schema::validate_name("store", "").is_err());
    }

    #[test]
    fn journal_files_map_to_database() {
        assert_eq!(database_of("probe.sqlite3"), Some("probe"));
        assert_eq!(database_of("probe.sqlite3-journal"), Some("probe"));
        assert_eq!(database_of(".persisted"), None);
    }
}
