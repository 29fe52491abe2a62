use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use thiserror::Error;
use tracing::debug;

use crate::domain::{validate_transition, Intent, LoopQueueItem, QueueItemStatus};

use super::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("reorder set does not match the loop's pending items")]
    Mismatch,

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn parse_status(s: &str) -> QueueItemStatus {
    match s {
        "dispatched" => QueueItemStatus::Dispatched,
        "completed" => QueueItemStatus::Completed,
        "failed" => QueueItemStatus::Failed,
        "skipped" => QueueItemStatus::Skipped,
        _ => QueueItemStatus::Pending,
    }
}

fn status_name(s: QueueItemStatus) -> &'static str {
    match s {
        QueueItemStatus::Pending => "pending",
        QueueItemStatus::Dispatched => "dispatched",
        QueueItemStatus::Completed => "completed",
        QueueItemStatus::Failed => "failed",
        QueueItemStatus::Skipped => "skipped",
    }
}

fn row_to_item(row: &Row) -> rusqlite::Result<LoopQueueItem> {
    let intent_json: String = row.get("intent")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let dispatched_at: Option<String> = row.get("dispatched_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(LoopQueueItem {
        id: row.get("id")?,
        loop_id: row.get("loop_id")?,
        intent: serde_json::from_str::<Intent>(&intent_json).unwrap_or(Intent::Pause),
        position: row.get("position")?,
        status: parse_status(&status),
        attempts: row.get::<_, i64>("attempts")? as u32,
        error: row.get("error")?,
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        dispatched_at: dispatched_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        completed_at: completed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
    })
}

impl Store {
    /// Append `items` to a loop's queue, assigning strictly increasing
    /// positions starting at `max(position)+1`. A no-op for an empty slice.
    pub fn enqueue(&self, items: Vec<LoopQueueItem>) -> Result<Vec<LoopQueueItem>, StoreError> {
        if items.is_empty() {
            return Ok(items);
        }
        debug!(count = items.len(), "Store::enqueue: called");
        self.with_transaction(|tx| {
            let mut out = Vec::with_capacity(items.len());
            for mut item in items {
                let loop_id = item.loop_id.clone();
                let max_position: i64 = tx
                    .query_row("SELECT COALESCE(MAX(position), 0) FROM loop_queue_items WHERE loop_id = ?1", params![loop_id], |row| row.get(0))
                    .map_err(StoreError::from_sqlite)?;
                item.position = max_position + 1;
                tx.execute(
                    "INSERT INTO loop_queue_items (id, loop_id, intent, position, status, attempts, error,
                        created_at, dispatched_at, completed_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    params![
                        item.id,
                        item.loop_id,
                        serde_json::to_string(&item.intent)?,
                        item.position,
                        status_name(item.status),
                        item.attempts as i64,
                        item.error,
                        item.created_at.to_rfc3339(),
                        item.dispatched_at.map(|t| t.to_rfc3339()),
                        item.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )
                .map_err(StoreError::from_sqlite)?;
                out.push(item);
            }
            Ok(out)
        })
    }

    /// The pending item with the lowest position, if any.
    pub fn peek(&self, loop_id: &str) -> Result<Option<LoopQueueItem>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT * FROM loop_queue_items WHERE loop_id = ?1 AND status = 'pending' ORDER BY position ASC LIMIT 1",
            params![loop_id],
            row_to_item,
        )
        .optional()
        .map_err(StoreError::from_sqlite)
    }

    /// All pending items for a loop, in position order.
    pub fn pending_items(&self, loop_id: &str) -> Result<Vec<LoopQueueItem>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM loop_queue_items WHERE loop_id = ?1 AND status = 'pending' ORDER BY position ASC")
            .map_err(StoreError::from_sqlite)?;
        let rows = stmt.query_map(params![loop_id], row_to_item).map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }

    pub fn dequeue(&self, loop_id: &str) -> Result<Option<LoopQueueItem>, StoreError> {
        debug!(loop_id, "Store::dequeue: called");
        self.with_transaction(|tx| {
            let item = tx
                .query_row(
                    "SELECT * FROM loop_queue_items WHERE loop_id = ?1 AND status = 'pending' ORDER BY position ASC LIMIT 1",
                    params![loop_id],
                    row_to_item,
                )
                .optional()
                .map_err(StoreError::from_sqlite)?;
            let Some(mut item) = item else { return Ok(None) };
            item.dispatch();
            tx.execute(
                "UPDATE loop_queue_items SET status='dispatched', attempts=?2, dispatched_at=?3 WHERE id=?1",
                params![item.id, item.attempts as i64, item.dispatched_at.map(|t| t.to_rfc3339())],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(Some(item))
        })
    }

    pub fn update_item_status(&self, item_id: &str, status: QueueItemStatus, error: Option<String>) -> Result<(), StoreError> {
        debug!(item_id, ?status, "Store::update_item_status: called");
        self.with_transaction(|tx| {
            let current: String = tx
                .query_row("SELECT status FROM loop_queue_items WHERE id = ?1", params![item_id], |row| row.get(0))
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("queue item {item_id}")),
                    other => StoreError::from_sqlite(other),
                })?;
            validate_transition(parse_status(&current), status).map_err(|e| StoreError::Decode {
                column: "status",
                message: e.to_string(),
            })?;
            let completed_at = if status.is_terminal() { Some(Utc::now().to_rfc3339()) } else { None };
            tx.execute(
                "UPDATE loop_queue_items SET status=?2, error=?3, completed_at=?4 WHERE id=?1",
                params![item_id, status_name(status), error, completed_at],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(())
        })
    }

    /// Mark a still-`pending` item completed in one step, for items the
    /// Supervisor drains directly off the pending list without a separate
    /// dispatch phase (e.g. a `message_append` consumed into a prompt, or a
    /// control intent consumed to halt iteration without ever starting a
    /// run). Transitions `pending -> dispatched -> completed` atomically so
    /// the allowed-transition table in `domain::queue` is not bypassed, and
    /// records both `dispatched_at` and `completed_at` as now.
    pub fn complete_drained_item(&self, item_id: &str, error: Option<String>) -> Result<(), StoreError> {
        debug!(item_id, "Store::complete_drained_item: called");
        self.with_transaction(|tx| {
            let current: String = tx
                .query_row("SELECT status FROM loop_queue_items WHERE id = ?1", params![item_id], |row| row.get(0))
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("queue item {item_id}")),
                    other => StoreError::from_sqlite(other),
                })?;
            validate_transition(parse_status(&current), QueueItemStatus::Dispatched).map_err(|e| StoreError::Decode {
                column: "status",
                message: e.to_string(),
            })?;
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE loop_queue_items SET status=?2, attempts=attempts+1, error=?3, dispatched_at=?4, completed_at=?4 WHERE id=?1",
                params![item_id, status_name(QueueItemStatus::Completed), error, now],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(())
        })
    }

    /// Rewrite positions 1..N for exactly the given ordered set of pending
    /// item ids. Fails if the set does not exactly match the loop's current
    /// pending items.
    pub fn reorder(&self, loop_id: &str, ordered_ids: &[String]) -> Result<(), ReorderError> {
        debug!(loop_id, count = ordered_ids.len(), "Store::reorder: called");
        self.with_transaction(|tx| {
            let mut current: Vec<String> = {
                let mut stmt = tx
                    .prepare("SELECT id FROM loop_queue_items WHERE loop_id = ?1 AND status = 'pending'")
                    .map_err(StoreError::from_sqlite)?;
                let rows = stmt.query_map(params![loop_id], |row| row.get::<_, String>(0)).map_err(StoreError::from_sqlite)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)?
            };
            current.sort();
            let mut wanted = ordered_ids.to_vec();
            wanted.sort();
            if current != wanted {
                return Err(StoreError::Decode {
                    column: "ordered_ids",
                    message: "reorder set does not match pending items".to_string(),
                });
            }
            for (idx, id) in ordered_ids.iter().enumerate() {
                tx.execute(
                    "UPDATE loop_queue_items SET position = ?2 WHERE id = ?1",
                    params![id, (idx as i64) + 1],
                )
                .map_err(StoreError::from_sqlite)?;
            }
            Ok(())
        })
        .map_err(|e| match e {
            StoreError::Decode { column: "ordered_ids", .. } => ReorderError::Mismatch,
            other => ReorderError::Store(other),
        })
    }

    /// Delete all pending items for a loop; dispatched/terminal items are preserved.
    pub fn clear_pending(&self, loop_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("DELETE FROM loop_queue_items WHERE loop_id = ?1 AND status = 'pending'", params![loop_id])
            .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    pub fn remove_item(&self, item_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = conn.execute("DELETE FROM loop_queue_items WHERE id = ?1", params![item_id]).map_err(StoreError::from_sqlite)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("queue item {item_id}")));
        }
        Ok(())
    }
}

use rusqlite::OptionalExtension;
