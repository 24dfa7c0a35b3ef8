//! SQLite implementation of `ItemRepository`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

mod claims;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labelq_core::{CallerId, Item, ItemId, ItemStatus, Label, LabelAction, Outcome, Score};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    CallerCount, CallerStats, CompletionOutcome, GlobalStats, ImportSummary, ItemRepository,
    RepositoryError, RowLocks, RowReservation,
};
use crate::db;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Column list matching [`ItemRow`].
const ITEM_COLUMNS: &str = "id, text, text_hash, status, created_at";

/// SQLite-backed item repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteItemRepository {
    /// Exposed as `pub(crate)` so tests can put rows into states the public
    /// API cannot reach.
    pub(crate) conn: Arc<Mutex<Connection>>,
    row_locks: RowLocks,
}

impl SqliteItemRepository {
    /// Open the repository at `path`, creating the file and schema if needed
    /// and running pending migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let conn = db::open_durable(path.as_ref())
            .map_err(|(operation, message)| RepositoryError::storage(operation, message))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            row_locks: RowLocks::new(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // v1: items and labels.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    text TEXT NOT NULL,
                    text_hash TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'locked', 'labeled', 'skipped'))
                );

                CREATE INDEX IF NOT EXISTS ix_items_status ON items(status);

                CREATE TABLE IF NOT EXISTS labels (
                    item_id INTEGER NOT NULL REFERENCES items(id),
                    user_id INTEGER NOT NULL,
                    score INTEGER CHECK (score IS NULL OR (score BETWEEN 0 AND 10)),
                    action TEXT NOT NULL CHECK (action IN ('rated', 'skipped')),
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (item_id, user_id)
                );

                CREATE INDEX IF NOT EXISTS ix_labels_user ON labels(user_id);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // v2: insertion timestamp for recency ordering. Rows that predate it
        // get 0 and sort behind everything inserted afterwards.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                ALTER TABLE items ADD COLUMN created_at INTEGER NOT NULL DEFAULT 0;
                CREATE INDEX IF NOT EXISTS ix_items_created_at ON items(created_at);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

/// Raw `items` row before status and timestamp decoding.
pub(super) struct ItemRow {
    id: i64,
    text: String,
    text_hash: String,
    status: String,
    created_at: i64,
}

impl ItemRow {
    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            text_hash: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    pub(super) fn into_item(self) -> Result<Item, RepositoryError> {
        let status: ItemStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::corruption(format!("status of item {}", self.id)))?;
        Ok(Item {
            id: ItemId(self.id),
            text: self.text,
            text_hash: self.text_hash,
            status,
            created_at: timestamp(self.created_at, "item created_at")?,
        })
    }
}

fn timestamp(millis: i64, what: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| RepositoryError::corruption(what))
}

fn label_from_parts(
    item_id: i64,
    user_id: i64,
    score: Option<i64>,
    action: String,
    created_at: i64,
) -> Result<Label, RepositoryError> {
    let action: LabelAction = action
        .parse()
        .map_err(|_| RepositoryError::corruption("label action"))?;
    let score = score
        .map(Score::try_from)
        .transpose()
        .map_err(|_| RepositoryError::corruption("label score"))?;
    Ok(Label {
        item_id: ItemId(item_id),
        user_id: CallerId(user_id),
        score,
        action,
        created_at: timestamp(created_at, "label created_at")?,
    })
}

fn get_item_sync(conn: &Connection, id: ItemId) -> Result<Option<Item>, RepositoryError> {
    let sql = format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS);
    conn.query_row(&sql, params![id.0], ItemRow::from_row)
        .optional()
        .map_err(|e| RepositoryError::storage("get", e.to_string()))?
        .map(ItemRow::into_item)
        .transpose()
}

fn insert_items_sync(
    conn: &mut Connection,
    texts: Vec<String>,
    created_at: i64,
) -> Result<ImportSummary, RepositoryError> {
    let tx = conn
        .transaction()
        .map_err(|e| RepositoryError::storage("insert_items", e.to_string()))?;
    let mut summary = ImportSummary::default();
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO items (text, text_hash, status, created_at)
                 VALUES (?1, ?2, 'pending', ?3)
                 ON CONFLICT(text_hash) DO NOTHING",
            )
            .map_err(|e| RepositoryError::storage("insert_items", e.to_string()))?;

        for text in texts {
            if text.trim().is_empty() {
                summary.rejected += 1;
                continue;
            }
            let hash = labelq_core::text_hash(&text);
            let inserted = stmt
                .execute(params![text, hash, created_at])
                .map_err(|e| RepositoryError::storage("insert_items", e.to_string()))?;
            if inserted > 0 {
                summary.loaded += 1;
            } else {
                summary.duplicates += 1;
            }
        }
    }
    tx.commit()
        .map_err(|e| RepositoryError::storage("insert_items", e.to_string()))?;
    Ok(summary)
}

fn global_stats_sync(conn: &Connection) -> Result<GlobalStats, RepositoryError> {
    let err = |e: rusqlite::Error| RepositoryError::storage("global_stats", e.to_string());

    let (total, labeled, remaining): (i64, i64, i64) = conn
        .query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'labeled'), 0),
                    COALESCE(SUM(status IN ('pending', 'locked')), 0)
             FROM items",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(err)?;

    let mut stmt = conn
        .prepare(
            "SELECT user_id, COUNT(*) FROM labels
             WHERE action = 'rated'
             GROUP BY user_id ORDER BY user_id",
        )
        .map_err(err)?;
    let per_caller = stmt
        .query_map([], |row| {
            Ok(CallerCount {
                caller: CallerId(row.get(0)?),
                rated: row.get::<_, i64>(1)? as u64,
            })
        })
        .map_err(err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(err)?;

    Ok(GlobalStats {
        total: total as u64,
        labeled: labeled as u64,
        remaining: remaining as u64,
        per_caller,
    })
}

fn caller_stats_sync(conn: &Connection, caller: CallerId) -> Result<CallerStats, RepositoryError> {
    let err = |e: rusqlite::Error| RepositoryError::storage("caller_stats", e.to_string());
    let mut stmt = conn
        .prepare("SELECT action, COUNT(*) FROM labels WHERE user_id = ?1 GROUP BY action")
        .map_err(err)?;
    let rows = stmt
        .query_map(params![caller.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(err)?;

    let mut stats = CallerStats::default();
    for row in rows {
        let (action, count) = row.map_err(err)?;
        match action.parse::<LabelAction>() {
            Ok(LabelAction::Rated) => stats.rated = count as u64,
            Ok(LabelAction::Skipped) => stats.skipped = count as u64,
            Err(_) => return Err(RepositoryError::corruption("label action")),
        }
    }
    Ok(stats)
}

fn labels_for_item_sync(conn: &Connection, id: ItemId) -> Result<Vec<Label>, RepositoryError> {
    let err = |e: rusqlite::Error| RepositoryError::storage("labels_for_item", e.to_string());
    let mut stmt = conn
        .prepare(
            "SELECT item_id, user_id, score, action, created_at
             FROM labels WHERE item_id = ?1 ORDER BY user_id",
        )
        .map_err(err)?;
    let rows = stmt
        .query_map(params![id.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })
        .map_err(err)?;

    let mut labels = Vec::new();
    for row in rows {
        let (item_id, user_id, score, action, created_at) = row.map_err(err)?;
        labels.push(label_from_parts(item_id, user_id, score, action, created_at)?);
    }
    Ok(labels)
}

#[async_trait]
impl ItemRepository for SqliteItemRepository {
    async fn insert_items(&self, texts: Vec<String>) -> Result<ImportSummary, RepositoryError> {
        let created_at = db::now_millis();
        self.blocking("insert_items", move |conn| {
            insert_items_sync(conn, texts, created_at)
        })
        .await
    }

    async fn get(&self, id: ItemId) -> Result<Option<Item>, RepositoryError> {
        self.blocking("get", move |conn| get_item_sync(conn, id)).await
    }

    async fn reserve_pending(
        &self,
        caller: CallerId,
        exclude: &[ItemId],
    ) -> Result<Option<RowReservation>, RepositoryError> {
        let exclude = exclude.to_vec();
        let row_locks = self.row_locks.clone();
        self.blocking("reserve_pending", move |conn| {
            claims::reserve_pending_sync(conn, &row_locks, caller, &exclude)
        })
        .await
    }

    async fn mark_locked(
        &self,
        reservation: RowReservation,
    ) -> Result<Option<Item>, RepositoryError> {
        // The reservation moves into the closure and is released only after
        // the update has run.
        self.blocking("mark_locked", move |conn| {
            claims::mark_locked_sync(conn, reservation)
        })
        .await
    }

    async fn complete(
        &self,
        item_id: ItemId,
        caller: CallerId,
        outcome: Outcome,
    ) -> Result<CompletionOutcome, RepositoryError> {
        let created_at = db::now_millis();
        self.blocking("complete", move |conn| {
            claims::complete_sync(conn, item_id, caller, outcome, created_at)
        })
        .await
    }

    async fn locked_ids(&self) -> Result<Vec<ItemId>, RepositoryError> {
        self.blocking("locked_ids", |conn| claims::locked_ids_sync(conn))
            .await
    }

    async fn reset_to_pending(&self, id: ItemId) -> Result<bool, RepositoryError> {
        self.blocking("reset_to_pending", move |conn| {
            claims::reset_to_pending_sync(conn, id)
        })
        .await
    }

    async fn labels_for_item(&self, id: ItemId) -> Result<Vec<Label>, RepositoryError> {
        self.blocking("labels_for_item", move |conn| labels_for_item_sync(conn, id))
            .await
    }

    async fn global_stats(&self) -> Result<GlobalStats, RepositoryError> {
        self.blocking("global_stats", |conn| global_stats_sync(conn))
            .await
    }

    async fn caller_stats(&self, caller: CallerId) -> Result<CallerStats, RepositoryError> {
        self.blocking("caller_stats", move |conn| caller_stats_sync(conn, caller))
            .await
    }
}
