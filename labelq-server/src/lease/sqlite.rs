//! SQLite lease backend.
//!
//! Lives in its own database file so that it fails independently of the item
//! database. Expiry is stored as unix milliseconds; rows past their deadline
//! are ignored by every read and overwritten by `set_if_absent`, and
//! `purge_expired` deletes them for good.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{LeaseBackend, LeaseStoreError};
use crate::db;

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteLeaseBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, LeaseStoreError> {
        let conn = db::open_durable(path.as_ref())
            .map_err(|(operation, message)| LeaseStoreError::storage(operation, message))?;

        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| LeaseStoreError::storage("get schema version", e.to_string()))?;
        if version > SCHEMA_VERSION {
            return Err(LeaseStoreError::storage(
                "schema version",
                format!(
                    "Lease database schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                ),
            ));
        }
        if version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS leases (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    expires_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS ix_leases_expires_at ON leases(expires_at);
                "#,
            )
            .map_err(|e| LeaseStoreError::storage("migration v1", e.to_string()))?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| LeaseStoreError::storage("set schema version", e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn new_in_memory() -> Result<Self, LeaseStoreError> {
        Self::new(":memory:")
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, LeaseStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, i64) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| LeaseStoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut *conn, db::now_millis())
                .map_err(|e| LeaseStoreError::storage(operation, e.to_string()))
        })
        .await
        .map_err(|e| LeaseStoreError::storage(operation, e.to_string()))?
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl LeaseBackend for SqliteLeaseBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let ttl = ttl_millis(ttl);
        self.blocking("set_if_absent", move |conn, now| {
            // The conflict branch only fires for an expired row, so the
            // statement changes a row exactly when the key was free.
            let changed = conn.execute(
                "INSERT INTO leases (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                    SET value = excluded.value, expires_at = excluded.expires_at
                    WHERE leases.expires_at IS NOT NULL AND leases.expires_at <= ?4",
                params![key, value, now.saturating_add(ttl), now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LeaseStoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking("set", move |conn, _now| {
            conn.execute(
                "INSERT INTO leases (key, value, expires_at) VALUES (?1, ?2, NULL)
                 ON CONFLICT(key) DO UPDATE
                    SET value = excluded.value, expires_at = NULL",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LeaseStoreError> {
        let key = key.to_string();
        self.blocking("get", move |conn, now| {
            conn.query_row(
                "SELECT value FROM leases
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, LeaseStoreError> {
        let keys = keys.to_vec();
        self.blocking("delete", move |conn, now| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut live = tx.prepare(
                    "DELETE FROM leases
                     WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                )?;
                let mut any = tx.prepare("DELETE FROM leases WHERE key = ?1")?;
                for key in &keys {
                    removed += live.execute(params![key, now])?;
                    any.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, LeaseStoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking("delete_if_value", move |conn, now| {
            let removed = conn.execute(
                "DELETE FROM leases
                 WHERE key = ?1 AND value = ?2
                   AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, value, now],
            )?;
            Ok(removed == 1)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, LeaseStoreError> {
        self.blocking("purge_expired", move |conn, now| {
            conn.execute(
                "DELETE FROM leases WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
        })
        .await
    }
}
