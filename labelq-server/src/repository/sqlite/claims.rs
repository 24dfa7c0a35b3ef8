//! Claim, completion and reset operations for the SQLite repository.
//!
//! Every status write is `UPDATE ... WHERE id = ? AND status = <expected>`, so
//! a write against a row that moved underneath it changes nothing and is
//! reported as such instead of clobbering the newer state.

use labelq_core::{CallerId, Item, ItemId, ItemStatus, Label, Outcome};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use super::super::{CompletionOutcome, RepositoryError, RowLocks, RowReservation};
use super::{timestamp, ItemRow, ITEM_COLUMNS};

/// Walk pending rows newest-first and reserve the first one that is neither
/// excluded nor reserved by another claim.
///
/// Rows are read lazily, so a long pending backlog costs only as many rows as
/// are skipped.
pub(super) fn reserve_pending_sync(
    conn: &Connection,
    row_locks: &RowLocks,
    caller: CallerId,
    exclude: &[ItemId],
) -> Result<Option<RowReservation>, RepositoryError> {
    let err = |e: rusqlite::Error| RepositoryError::storage("reserve_pending", e.to_string());

    let sql = format!(
        "SELECT {} FROM items
         WHERE status = ?1
           AND NOT EXISTS (
               SELECT 1 FROM labels
               WHERE labels.item_id = items.id AND labels.user_id = ?2
           )
         ORDER BY created_at DESC, id DESC",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(err)?;
    let mut rows = stmt
        .query(params![ItemStatus::Pending.as_str(), caller.0])
        .map_err(err)?;

    while let Some(row) = rows.next().map_err(err)? {
        let id = ItemId(row.get(0).map_err(err)?);
        if exclude.contains(&id) {
            continue;
        }
        let Some(guard) = row_locks.try_lock(id) else {
            continue;
        };
        let item = ItemRow::from_row(row).map_err(err)?.into_item()?;
        return Ok(Some(RowReservation::new(item, guard)));
    }

    Ok(None)
}

pub(super) fn mark_locked_sync(
    conn: &Connection,
    reservation: RowReservation,
) -> Result<Option<Item>, RepositoryError> {
    let id = reservation.item_id();
    let updated = conn
        .execute(
            "UPDATE items SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![
                ItemStatus::Locked.as_str(),
                id.0,
                ItemStatus::Pending.as_str()
            ],
        )
        .map_err(|e| RepositoryError::storage("mark_locked", e.to_string()))?;

    if updated == 0 {
        return Ok(None);
    }

    let mut item = reservation.item().clone();
    item.status = ItemStatus::Locked;
    Ok(Some(item))
}

pub(super) fn complete_sync(
    conn: &mut Connection,
    item_id: ItemId,
    caller: CallerId,
    outcome: Outcome,
    created_at: i64,
) -> Result<CompletionOutcome, RepositoryError> {
    let err = |e: rusqlite::Error| RepositoryError::storage("complete", e.to_string());

    // IMMEDIATE takes the write lock up front so the checks below cannot be
    // invalidated by another process before the update lands.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(err)?;

    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM items WHERE id = ?1",
            params![item_id.0],
            |row| row.get(0),
        )
        .optional()
        .map_err(err)?;
    let Some(status) = status else {
        return Ok(CompletionOutcome::NotFound);
    };
    let status: ItemStatus = status
        .parse()
        .map_err(|_| RepositoryError::corruption(format!("status of item {}", item_id)))?;

    let already_labeled: bool = tx
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM labels WHERE item_id = ?1 AND user_id = ?2)",
            params![item_id.0, caller.0],
            |row| row.get(0),
        )
        .map_err(err)?;
    if already_labeled || status.is_terminal() {
        return Ok(CompletionOutcome::AlreadyCompleted);
    }

    let next = outcome.terminal_status();
    if !status.can_transition_to(next) {
        return Ok(CompletionOutcome::NotClaimed);
    }

    let updated = tx
        .execute(
            "UPDATE items SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![next.as_str(), item_id.0, status.as_str()],
        )
        .map_err(err)?;
    if updated == 0 {
        return Ok(CompletionOutcome::NotClaimed);
    }

    let inserted = tx.execute(
        "INSERT INTO labels (item_id, user_id, score, action, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            item_id.0,
            caller.0,
            outcome.score().map(|s| s.value()),
            outcome.action().as_str(),
            created_at
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        Err(e) => return Err(err(e)),
    }

    tx.commit().map_err(err)?;

    Ok(CompletionOutcome::Completed(Label::new(
        item_id,
        caller,
        outcome,
        timestamp(created_at, "label created_at")?,
    )))
}

pub(super) fn locked_ids_sync(conn: &Connection) -> Result<Vec<ItemId>, RepositoryError> {
    let err = |e: rusqlite::Error| RepositoryError::storage("locked_ids", e.to_string());
    let mut stmt = conn
        .prepare("SELECT id FROM items WHERE status = ?1 ORDER BY id")
        .map_err(err)?;
    let ids = stmt
        .query_map(params![ItemStatus::Locked.as_str()], |row| {
            row.get(0).map(ItemId)
        })
        .map_err(err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(err)?;
    Ok(ids)
}

pub(super) fn reset_to_pending_sync(
    conn: &Connection,
    id: ItemId,
) -> Result<bool, RepositoryError> {
    let updated = conn
        .execute(
            "UPDATE items SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![
                ItemStatus::Pending.as_str(),
                id.0,
                ItemStatus::Locked.as_str()
            ],
        )
        .map_err(|e| RepositoryError::storage("reset_to_pending", e.to_string()))?;
    Ok(updated > 0)
}
