use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::domain::{id::generate_short_id, Loop, LoopState};

use super::{Store, StoreError};

fn parse_state(s: &str) -> LoopState {
    match s {
        "stopped" => LoopState::Stopped,
        "sleeping" => LoopState::Sleeping,
        "waiting" => LoopState::Waiting,
        "running" => LoopState::Running,
        _ => LoopState::Error,
    }
}

fn state_name(s: LoopState) -> &'static str {
    match s {
        LoopState::Stopped => "stopped",
        LoopState::Sleeping => "sleeping",
        LoopState::Waiting => "waiting",
        LoopState::Running => "running",
        LoopState::Error => "error",
    }
}

fn row_to_loop(row: &Row) -> rusqlite::Result<Loop> {
    let tags_json: String = row.get("tags")?;
    let metadata_json: String = row.get("metadata")?;
    let state: String = row.get("state")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_run_at: Option<String> = row.get("last_run_at")?;

    Ok(Loop {
        id: row.get("id")?,
        short_id: row.get("short_id")?,
        name: row.get("name")?,
        repo_path: row.get("repo_path")?,
        base_prompt_path: row.get("base_prompt_path")?,
        base_prompt_msg: row.get("base_prompt_msg")?,
        pool_id: row.get("pool_id")?,
        profile_id: row.get("profile_id")?,
        interval_seconds: row.get::<_, i64>("interval_seconds")? as u64,
        state: parse_state(&state),
        last_run_at: last_run_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        last_exit_code: row.get("last_exit_code")?,
        last_error: row.get("last_error")?,
        log_path: row.get("log_path")?,
        ledger_path: row.get("ledger_path")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
    })
}

impl Store {
    /// Create a loop, generating a unique `short_id` if the caller left it empty.
    pub fn create_loop(&self, mut loop_: Loop) -> Result<Loop, StoreError> {
        debug!(id = %loop_.id, name = %loop_.name, "Store::create_loop: called");
        self.with_transaction(|tx| {
            if loop_.short_id.is_empty() {
                loop_.short_id = generate_short_id(|candidate| {
                    tx.query_row("SELECT 1 FROM loops WHERE short_id = ?1", params![candidate], |_| Ok(()))
                        .optional()
                        .unwrap_or(None)
                        .is_some()
                })
                .map_err(|e| StoreError::Decode {
                    column: "short_id",
                    message: e.to_string(),
                })?;
            }
            tx.execute(
                "INSERT INTO loops (id, short_id, name, repo_path, base_prompt_path, base_prompt_msg, pool_id,
                    profile_id, interval_seconds, state, last_run_at, last_exit_code, last_error, log_path,
                    ledger_path, tags, metadata, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    loop_.id,
                    loop_.short_id,
                    loop_.name,
                    loop_.repo_path,
                    loop_.base_prompt_path,
                    loop_.base_prompt_msg,
                    loop_.pool_id,
                    loop_.profile_id,
                    loop_.interval_seconds as i64,
                    state_name(loop_.state),
                    loop_.last_run_at.map(|t| t.to_rfc3339()),
                    loop_.last_exit_code,
                    loop_.last_error,
                    loop_.log_path,
                    loop_.ledger_path,
                    serde_json::to_string(&loop_.tags)?,
                    serde_json::to_string(&loop_.metadata)?,
                    loop_.created_at.to_rfc3339(),
                    loop_.updated_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(loop_)
        })
    }

    pub fn get_loop(&self, id: &str) -> Result<Loop, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT * FROM loops WHERE id = ?1", params![id], row_to_loop)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("loop {id}")),
                other => StoreError::from_sqlite(other),
            })
    }

    pub fn list_loops(&self) -> Result<Vec<Loop>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM loops ORDER BY created_at ASC").map_err(StoreError::from_sqlite)?;
        let rows = stmt.query_map([], row_to_loop).map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }

    /// Resolve an operator reference (full name, full id, or short-id prefix
    /// of at least 4 chars) to a unique loop id.
    pub fn resolve_loop_ref(&self, reference: &str) -> Result<Option<String>, StoreError> {
        use std::collections::HashMap;
        let loops = self.list_loops()?;
        let entries: HashMap<String, (String, String)> =
            loops.into_iter().map(|l| (l.id.clone(), (l.name, l.short_id))).collect();
        match crate::domain::IdResolver::new(&entries).resolve(reference) {
            Ok(found) => Ok(found),
            Err(candidates) => Err(StoreError::Decode {
                column: "reference",
                message: format!("ambiguous reference {reference:?}: {candidates:?}"),
            }),
        }
    }

    pub fn update_loop(&self, loop_: &Loop) -> Result<(), StoreError> {
        debug!(id = %loop_.id, "Store::update_loop: called");
        self.with_transaction(|tx| update_loop_tx(tx, loop_))
    }

    /// Update the loop row and append an event in one transaction.
    pub fn update_loop_with_event(&self, loop_: &Loop, event: &crate::domain::Event) -> Result<(), StoreError> {
        debug!(id = %loop_.id, event_id = %event.id, "Store::update_loop_with_event: called");
        self.with_transaction(|tx| {
            update_loop_tx(tx, loop_)?;
            super::events::insert_event_tx(tx, event)
        })
    }

    pub fn delete_loop(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = conn.execute("DELETE FROM loops WHERE id = ?1", params![id]).map_err(StoreError::from_sqlite)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("loop {id}")));
        }
        Ok(())
    }
}

fn update_loop_tx(tx: &rusqlite::Transaction<'_>, loop_: &Loop) -> Result<(), StoreError> {
    let affected = tx
        .execute(
            "UPDATE loops SET short_id=?2, name=?3, repo_path=?4, base_prompt_path=?5, base_prompt_msg=?6,
                pool_id=?7, profile_id=?8, interval_seconds=?9, state=?10, last_run_at=?11, last_exit_code=?12,
                last_error=?13, log_path=?14, ledger_path=?15, tags=?16, metadata=?17, updated_at=?18
             WHERE id=?1",
            params![
                loop_.id,
                loop_.short_id,
                loop_.name,
                loop_.repo_path,
                loop_.base_prompt_path,
                loop_.base_prompt_msg,
                loop_.pool_id,
                loop_.profile_id,
                loop_.interval_seconds as i64,
                state_name(loop_.state),
                loop_.last_run_at.map(|t| t.to_rfc3339()),
                loop_.last_exit_code,
                loop_.last_error,
                loop_.log_path,
                loop_.ledger_path,
                serde_json::to_string(&loop_.tags)?,
                serde_json::to_string(&loop_.metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(StoreError::from_sqlite)?;
    if affected == 0 {
        return Err(StoreError::NotFound(format!("loop {}", loop_.id)));
    }
    Ok(())
}
