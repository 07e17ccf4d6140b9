//! Transactional write primitives on top of the gateway's connection.
//!
//! Each primitive settles as one success or failure for the whole call.
//! Operation rejections abort the transaction, except inside
//! [`StorageGateway::batch_add`], which tallies them and still commits.

use crate::errors::{BackendError, ProbeError};
use crate::gateway::StorageGateway;
use crate::payload::Payload;
use crate::sink::Destination;
use crate::storage::{Key, Transaction, TxMode};

impl StorageGateway {
    async fn begin(&self, store: &str) -> Result<Box<dyn Transaction>, ProbeError> {
        let conn = self.open().await?;
        if !conn.contains_store(store) {
            return Err(ProbeError::StoreNotFound(store.to_string()));
        }
        conn.transaction(&[store], TxMode::ReadWrite)
            .await
            .map_err(|e| ProbeError::from_backend(store, e))
    }

    /// Insert or overwrite one record.
    pub async fn put(&self, store: &str, key: Key, value: Payload) -> Result<(), ProbeError> {
        let mut tx = self.begin(store).await?;
        if let Err(e) = tx.put(store, key, value).await {
            tx.abort().await;
            return Err(ProbeError::from_op(store, e));
        }
        tx.commit().await.map_err(|e| ProbeError::from_op(store, e))
    }

    /// Insert one record under a fresh key; returns the assigned key.
    pub async fn add(
        &self,
        store: &str,
        value: Payload,
        key: Option<Key>,
    ) -> Result<Key, ProbeError> {
        let mut tx = self.begin(store).await?;
        let key = match tx.add(store, key, value).await {
            Ok(key) => key,
            Err(e) => {
                tx.abort().await;
                return Err(ProbeError::from_op(store, e));
            }
        };
        tx.commit()
            .await
            .map_err(|e| ProbeError::from_op(store, e))?;
        Ok(key)
    }

    /// Insert `count` copies of `item` in one transaction.
    ///
    /// Rejected items do not abort the transaction. If any were rejected the
    /// call fails with [`ProbeError::PartialBatchFailure`] even though the
    /// accepted items are committed.
    pub async fn batch_add(&self, store: &str, count: u64, item: &Payload) -> Result<(), ProbeError> {
        let mut tx = self.begin(store).await?;
        let mut failed = 0u64;
        for index in 0..count {
            if let Err(e) = tx.add(store, None, item.clone()).await {
                failed += 1;
                if tx.is_aborted() {
                    tracing::debug!(store, index, error = %e, "batch transaction rolled back");
                    return Err(ProbeError::from_op(store, e));
                }
                tracing::trace!(store, index, error = %e, "batch item rejected");
            }
        }
        tx.commit()
            .await
            .map_err(|e| ProbeError::from_op(store, e))?;
        if failed > 0 {
            tracing::warn!(store, failed, count, "batch add committed with rejected items");
            return Err(ProbeError::PartialBatchFailure {
                failed,
                committed: count - failed,
            });
        }
        Ok(())
    }

    /// Clear every listed store that exists; missing ones are skipped.
    pub async fn clear(&self, stores: &[&str]) -> Result<(), ProbeError> {
        let conn = self.open().await?;
        let existing: Vec<&str> = stores
            .iter()
            .copied()
            .filter(|s| conn.contains_store(s))
            .collect();
        if existing.is_empty() {
            tracing::debug!(?stores, "no existing stores to clear");
            return Ok(());
        }
        let scope = existing.join(",");
        let mut tx = conn
            .transaction(&existing, TxMode::ReadWrite)
            .await
            .map_err(|e| ProbeError::from_backend(&scope, e))?;
        for store in &existing {
            if let Err(e) = tx.clear(store).await {
                tx.abort().await;
                return Err(ProbeError::from_op(store, e));
            }
        }
        tx.commit()
            .await
            .map_err(|e| ProbeError::from_op(&scope, e))?;
        tracing::debug!(stores = %scope, "stores cleared");
        Ok(())
    }

    /// Close the connection, wait for the close to settle, then delete the
    /// whole database.
    pub async fn delete_database(&self) -> Result<(), ProbeError> {
        let name = self.database().name.clone();
        self.close();
        tokio::time::sleep(self.delete_grace).await;
        tracing::info!(database = %name, "deleting database");
        match self.backend().delete_database(&name).await {
            Ok(()) => Ok(()),
            Err(BackendError::Blocked(detail)) => {
                self.channel(Destination::Clear).error(
                    "Deleting the database was blocked. Close every other connection to it, then clear again.",
                );
                Err(ProbeError::DeleteBlocked(detail))
            }
            Err(e) => Err(ProbeError::Unexpected(e.to_string())),
        }
    }
}
