use super::schema::table_name;
use super::SharedConn;
use crate::errors::OpError;
use crate::payload::Payload;
use crate::storage::{Key, Transaction, TxMode};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::PoisonError;

/// Transaction over one SQLite connection.
///
/// Every operation runs inside its own savepoint so a rejected write leaves
/// the enclosing transaction intact. When SQLite rolls the whole transaction
/// back by itself (disk full, I/O error) the transaction is marked aborted.
pub struct SqliteTransaction {
    conn: SharedConn,
    /// Store name to auto-increment flag, for stores in scope.
    scope: BTreeMap<String, bool>,
    mode: TxMode,
    aborted: bool,
    finished: bool,
}

impl SqliteTransaction {
    pub(crate) fn begin(
        conn: SharedConn,
        scope: BTreeMap<String, bool>,
        mode: TxMode,
    ) -> Result<Self, OpError> {
        {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let c = guard.as_ref().ok_or(OpError::Inactive)?;
            match mode {
                TxMode::ReadOnly => c.execute_batch("BEGIN DEFERRED")?,
                TxMode::ReadWrite => c.execute_batch("BEGIN IMMEDIATE")?,
            }
        }
        Ok(Self {
            conn,
            scope,
            mode,
            aborted: false,
            finished: false,
        })
    }

    fn auto_increment(&self, store: &str, write: bool) -> Result<bool, OpError> {
        if self.aborted {
            return Err(OpError::Aborted("rolled back by the database".to_string()));
        }
        if self.finished {
            return Err(OpError::Inactive);
        }
        let auto = *self
            .scope
            .get(store)
            .ok_or_else(|| OpError::StoreNotFound(store.to_string()))?;
        if write && self.mode == TxMode::ReadOnly {
            return Err(OpError::Rejected(
                "write in a read-only transaction".to_string(),
            ));
        }
        Ok(auto)
    }

    fn run<T>(
        &mut self,
        f: impl FnOnce(&Connection) -> Result<T, OpError>,
    ) -> Result<T, OpError> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(OpError::Inactive)?;
        conn.execute_batch("SAVEPOINT op")?;
        match f(conn) {
            Ok(v) => {
                conn.execute_batch("RELEASE op")?;
                Ok(v)
            }
            Err(e) => {
                if conn.is_autocommit() {
                    self.aborted = true;
                } else {
                    let _ = conn.execute_batch("ROLLBACK TO op; RELEASE op");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn get(&mut self, store: &str, key: &Key) -> Result<Option<Payload>, OpError> {
        self.auto_increment(store, false)?;
        let sql = format!("SELECT value FROM {} WHERE key = ?1", table_name(store));
        self.run(|c| {
            let value = c
                .query_row(&sql, params![key], |r| r.get::<_, Vec<u8>>(0))
                .optional()?;
            Ok(value.map(Payload::from))
        })
    }

    async fn put(&mut self, store: &str, key: Key, value: Payload) -> Result<(), OpError> {
        self.auto_increment(store, true)?;
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            table_name(store)
        );
        self.run(|c| {
            c.execute(&sql, params![key, value.as_bytes()])?;
            Ok(())
        })
    }

    async fn add(
        &mut self,
        store: &str,
        key: Option<Key>,
        value: Payload,
    ) -> Result<Key, OpError> {
        let auto = self.auto_increment(store, true)?;
        let table = table_name(store);
        match key {
            Some(key) => {
                let sql = format!("INSERT INTO {table} (key, value) VALUES (?1, ?2)");
                self.run(|c| {
                    c.execute(&sql, params![key, value.as_bytes()])?;
                    Ok(key)
                })
            }
            None if auto => {
                let sql = format!("INSERT INTO {table} (value) VALUES (?1)");
                self.run(|c| {
                    c.execute(&sql, params![value.as_bytes()])?;
                    Ok(Key::Int(c.last_insert_rowid()))
                })
            }
            None => Err(OpError::Rejected(format!(
                "store {store} requires an explicit key"
            ))),
        }
    }

    async fn clear(&mut self, store: &str) -> Result<(), OpError> {
        self.auto_increment(store, true)?;
        let sql = format!("DELETE FROM {}", table_name(store));
        self.run(|c| {
            c.execute(&sql, [])?;
            Ok(())
        })
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }

    async fn commit(mut self: Box<Self>) -> Result<(), OpError> {
        if self.aborted {
            return Err(OpError::Aborted("rolled back by the database".to_string()));
        }
        self.finished = true;
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard
            .as_ref()
            .ok_or_else(|| OpError::Aborted("connection closed before commit".to_string()))?;
        if let Err(e) = conn.execute_batch("COMMIT") {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("ROLLBACK");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.rollback();
    }
}

impl SqliteTransaction {
    fn rollback(&mut self) {
        if self.finished || self.aborted {
            return;
        }
        self.finished = true;
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = guard.as_ref() {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        self.rollback();
    }
}
