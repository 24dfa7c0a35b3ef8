//! Shared SQLite connection setup.
//!
//! Both the item database and the lease database are opened through here so
//! they get the same durability settings:
//! - `journal_mode = WAL` for concurrency and crash safety
//! - `synchronous = FULL` so a committed transition survives power loss
//! - `busy_timeout = 5000ms` so concurrent processes wait instead of failing
//!
//! Errors are returned as `(operation, message)` so each store can wrap them
//! in its own error type.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tracing::warn;

pub(crate) type OpenError = (&'static str, String);

pub(crate) fn is_in_memory(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    path_str == ":memory:" || path_str.is_empty()
}

/// Open (or create) a database file and apply the durability pragmas.
pub(crate) fn open_durable(path: &Path) -> Result<Connection, OpenError> {
    let in_memory = is_in_memory(path);

    if !in_memory {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    (
                        "create database directory",
                        format!("{}: {}", parent.display(), e),
                    )
                })?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let dir_permissions = std::fs::Permissions::from_mode(0o700);
                    if let Err(e) = std::fs::set_permissions(parent, dir_permissions) {
                        warn!(
                            "Failed to set restrictive permissions on state directory: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    let conn = if in_memory {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    }
    .map_err(|e| ("open database", e.to_string()))?;

    // SQLite can silently stay in DELETE mode on filesystems without shared
    // memory support. In-memory databases report "memory".
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(|e| ("set journal_mode", e.to_string()))?;
    let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
        || (in_memory && journal_mode.eq_ignore_ascii_case("memory"));
    if !journal_mode_ok {
        return Err((
            "configure journal_mode",
            format!(
                "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                journal_mode
            ),
        ));
    }

    conn.execute_batch(
        r#"
        PRAGMA synchronous = FULL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        "#,
    )
    .map_err(|e| ("configure pragmas", e.to_string()))?;

    Ok(conn)
}

/// Wall-clock unix time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
