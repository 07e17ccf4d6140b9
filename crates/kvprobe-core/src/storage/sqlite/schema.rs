use super::SqliteOptions;
use crate::errors::BackendError;
use crate::storage::{StoreSpec, UpgradeInfo};
use rusqlite::limits::Limit;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

const META_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_stores (
    name           TEXT PRIMARY KEY,
    auto_increment INTEGER NOT NULL
);
";

/// Table backing a store. Names are validated, so quoting is enough.
pub(crate) fn table_name(store: &str) -> String {
    format!("\"store_{store}\"")
}

pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), BackendError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(BackendError::InvalidSchema(format!(
            "{kind} name {name:?} must be non-empty ASCII letters, digits, '_' or '-'"
        )))
    }
}

pub(crate) fn init_connection(conn: &Connection, options: &SqliteOptions) -> Result<(), BackendError> {
    let _ = conn.execute("PRAGMA busy_timeout = 5000", []);
    if let Some(quota) = options.quota_bytes {
        let page_size: i64 = conn.pragma_query_value(None, "page_size", |r| r.get(0))?;
        let pages = (quota as i64 / page_size.max(1)).max(1);
        conn.pragma_update_and_check(None, "max_page_count", pages, |r| r.get::<_, i64>(0))?;
    }
    conn.execute_batch(META_SCHEMA)?;
    Ok(())
}

/// Cap row size. Applied after schema setup, which writes rows of its own.
pub(crate) fn apply_record_limit(conn: &Connection, options: &SqliteOptions) {
    if let Some(max) = options.max_record_bytes {
        let limit = i32::try_from(max).unwrap_or(i32::MAX).max(1);
        let _ = conn.set_limit(Limit::SQLITE_LIMIT_LENGTH, limit);
    }
}

pub(crate) fn stored_version(conn: &Connection) -> Result<u32, BackendError> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |r| r.get(0))?;
    Ok(u32::try_from(v).unwrap_or(0))
}

/// Create missing stores and bump `user_version`, atomically.
pub(crate) fn upgrade(
    conn: &Connection,
    old_version: u32,
    new_version: u32,
    schema: &[StoreSpec],
) -> Result<UpgradeInfo, BackendError> {
    let existing = list_stores(conn)?;
    conn.execute("BEGIN IMMEDIATE", [])?;
    let result = (|| -> Result<Vec<String>, BackendError> {
        let mut created = Vec::new();
        for spec in schema {
            if existing.contains_key(&spec.name) {
                continue;
            }
            let key_column = if spec.auto_increment {
                "key INTEGER PRIMARY KEY AUTOINCREMENT"
            } else {
                "key PRIMARY KEY"
            };
            conn.execute_batch(&format!(
                "CREATE TABLE {} ({key_column}, value BLOB NOT NULL);",
                table_name(&spec.name)
            ))?;
            conn.execute(
                "INSERT INTO kv_stores (name, auto_increment) VALUES (?1, ?2)",
                params![spec.name, spec.auto_increment],
            )?;
            created.push(spec.name.clone());
        }
        conn.pragma_update(None, "user_version", new_version)?;
        Ok(created)
    })();

    match result {
        Ok(created) => {
            conn.execute("COMMIT", [])?;
            Ok(UpgradeInfo {
                old_version,
                new_version,
                created_stores: created,
            })
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

/// Store name to auto-increment flag.
pub(crate) fn list_stores(conn: &Connection) -> Result<BTreeMap<String, bool>, BackendError> {
    let mut stmt = conn.prepare("SELECT name, auto_increment FROM kv_stores")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, bool>(1)?)))?;
    let mut stores = BTreeMap::new();
    for row in rows {
        let (name, auto) = row?;
        stores.insert(name, auto);
    }
    Ok(stores)
}
