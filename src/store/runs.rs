use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::domain::{LoopRun, PromptSource, RunStatus};

use super::profiles::count_running_tx;
use super::{Store, StoreError};

fn parse_status(s: &str) -> RunStatus {
    match s {
        "success" => RunStatus::Success,
        "error" => RunStatus::Error,
        "killed" => RunStatus::Killed,
        _ => RunStatus::Running,
    }
}

fn status_name(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Running => "running",
        RunStatus::Success => "success",
        RunStatus::Error => "error",
        RunStatus::Killed => "killed",
    }
}

fn parse_prompt_source(s: &str) -> PromptSource {
    match s {
        "override" => PromptSource::Override,
        "steer" => PromptSource::Steer,
        _ => PromptSource::Base,
    }
}

fn prompt_source_name(s: PromptSource) -> &'static str {
    match s {
        PromptSource::Base => "base",
        PromptSource::Override => "override",
        PromptSource::Steer => "steer",
    }
}

fn row_to_run(row: &Row) -> rusqlite::Result<LoopRun> {
    let status: String = row.get("status")?;
    let prompt_source: String = row.get("prompt_source")?;
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let metadata: String = row.get("metadata")?;

    Ok(LoopRun {
        id: row.get("id")?,
        loop_id: row.get("loop_id")?,
        profile_id: row.get("profile_id")?,
        status: parse_status(&status),
        prompt_source: parse_prompt_source(&prompt_source),
        prompt_path: row.get("prompt_path")?,
        prompt_override: row.get::<_, i64>("prompt_override")? != 0,
        started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
        finished_at: finished_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        exit_code: row.get("exit_code")?,
        output_tail: row.get("output_tail")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
    })
}

impl Store {
    /// Create a `running` `LoopRun`, enforcing `profile.max_concurrency` by
    /// counting currently-running runs for that profile inside the same
    /// transaction as the insert, so the check cannot race another caller.
    pub fn start_run(&self, run: LoopRun, max_concurrency: Option<u32>) -> Result<LoopRun, StoreError> {
        debug!(id = %run.id, loop_id = %run.loop_id, "Store::start_run: called");
        self.with_transaction(|tx| {
            if let (Some(profile_id), Some(cap)) = (run.profile_id.as_deref(), max_concurrency) {
                let running = count_running_tx(tx, profile_id)?;
                if running >= cap {
                    return Err(StoreError::Decode {
                        column: "profile_id",
                        message: format!("profile {profile_id} at concurrency cap ({running}/{cap})"),
                    });
                }
            }
            tx.execute(
                "INSERT INTO loop_runs (id, loop_id, profile_id, status, prompt_source, prompt_path,
                    prompt_override, started_at, finished_at, exit_code, output_tail, metadata)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    run.id,
                    run.loop_id,
                    run.profile_id,
                    status_name(run.status),
                    prompt_source_name(run.prompt_source),
                    run.prompt_path,
                    run.prompt_override as i64,
                    run.started_at.to_rfc3339(),
                    run.finished_at.map(|t| t.to_rfc3339()),
                    run.exit_code,
                    run.output_tail,
                    serde_json::to_string(&run.metadata)?,
                ],
            )
            .map_err(StoreError::from_sqlite)?;
            Ok(run)
        })
    }

    pub fn finish_run(&self, run: &LoopRun) -> Result<(), StoreError> {
        debug!(id = %run.id, status = ?run.status, "Store::finish_run: called");
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE loop_runs SET status=?2, finished_at=?3, exit_code=?4, output_tail=?5, metadata=?6 WHERE id=?1",
                params![
                    run.id,
                    status_name(run.status),
                    run.finished_at.map(|t| t.to_rfc3339()),
                    run.exit_code,
                    run.output_tail,
                    serde_json::to_string(&run.metadata)?,
                ],
            )
            .map_err(StoreError::from_sqlite)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("loop_run {}", run.id)));
        }
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<LoopRun, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT * FROM loop_runs WHERE id = ?1", params![id], row_to_run)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("loop_run {id}")),
                other => StoreError::from_sqlite(other),
            })
    }

    pub fn list_runs_for_loop(&self, loop_id: &str) -> Result<Vec<LoopRun>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM loop_runs WHERE loop_id = ?1 ORDER BY started_at ASC")
            .map_err(StoreError::from_sqlite)?;
        let rows = stmt.query_map(params![loop_id], row_to_run).map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }

    /// Most recent `profile_id` used by any run within the pool's member
    /// profiles, used by the selector to derive its round-robin cursor
    /// without an in-memory singleton.
    pub fn most_recent_profile_for_pool(&self, profile_ids: &[String]) -> Result<Option<String>, StoreError> {
        if profile_ids.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let placeholders = profile_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT profile_id FROM loop_runs WHERE profile_id IN ({placeholders}) ORDER BY started_at DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql).map_err(StoreError::from_sqlite)?;
        let params_dyn: Vec<&dyn rusqlite::ToSql> = profile_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let result = stmt
            .query_row(params_dyn.as_slice(), |row| row.get::<_, Option<String>>(0))
            .optional()
            .map_err(StoreError::from_sqlite)?;
        Ok(result.flatten())
    }
}

use rusqlite::OptionalExtension;
