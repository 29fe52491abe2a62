use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::domain::{Profile, PromptMode};

use super::{Store, StoreError};

fn parse_prompt_mode(s: &str) -> PromptMode {
    match s {
        "env" => PromptMode::Env,
        "path" => PromptMode::Path,
        _ => PromptMode::Stdin,
    }
}

fn prompt_mode_name(m: PromptMode) -> &'static str {
    match m {
        PromptMode::Env => "env",
        PromptMode::Stdin => "stdin",
        PromptMode::Path => "path",
    }
}

fn row_to_profile(row: &Row) -> rusqlite::Result<Profile> {
    let extra_args: String = row.get("extra_args")?;
    let env: String = row.get("env")?;
    let prompt_mode: String = row.get("prompt_mode")?;
    let cooldown_until: Option<String> = row.get("cooldown_until")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Profile {
        id: row.get("id")?,
        name: row.get("name")?,
        harness: row.get("harness")?,
        auth_kind: row.get("auth_kind")?,
        auth_home: row.get("auth_home")?,
        prompt_mode: parse_prompt_mode(&prompt_mode),
        command_template: row.get("command_template")?,
        model: row.get("model")?,
        extra_args: serde_json::from_str(&extra_args).unwrap_or_default(),
        env: serde_json::from_str::<HashMap<String, String>>(&env).unwrap_or_default(),
        max_concurrency: row.get::<_, i64>("max_concurrency")? as u32,
        cooldown_until: cooldown_until.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
    })
}

impl Store {
    pub fn create_profile(&self, profile: Profile) -> Result<Profile, StoreError> {
        debug!(id = %profile.id, name = %profile.name, "Store::create_profile: called");
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO profiles (id, name, harness, auth_kind, auth_home, prompt_mode, command_template, model,
                extra_args, env, max_concurrency, cooldown_until, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                profile.id,
                profile.name,
                profile.harness,
                profile.auth_kind,
                profile.auth_home,
                prompt_mode_name(profile.prompt_mode),
                profile.command_template,
                profile.model,
                serde_json::to_string(&profile.extra_args)?,
                serde_json::to_string(&profile.env)?,
                profile.max_concurrency as i64,
                profile.cooldown_until.map(|t| t.to_rfc3339()),
                profile.created_at.to_rfc3339(),
                profile.updated_at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::from_sqlite)?;
        Ok(profile)
    }

    pub fn get_profile(&self, id: &str) -> Result<Profile, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT * FROM profiles WHERE id = ?1", params![id], row_to_profile)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("profile {id}")),
                other => StoreError::from_sqlite(other),
            })
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM profiles ORDER BY created_at ASC").map_err(StoreError::from_sqlite)?;
        let rows = stmt.query_map([], row_to_profile).map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }

    pub fn update_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = conn
            .execute(
                "UPDATE profiles SET cooldown_until=?2, max_concurrency=?3, updated_at=?4 WHERE id=?1",
                params![
                    profile.id,
                    profile.cooldown_until.map(|t| t.to_rfc3339()),
                    profile.max_concurrency as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(StoreError::from_sqlite)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("profile {}", profile.id)));
        }
        Ok(())
    }

    pub fn delete_profile(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = conn.execute("DELETE FROM profiles WHERE id = ?1", params![id]).map_err(StoreError::from_sqlite)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("profile {id}")));
        }
        Ok(())
    }

    /// Count runs currently `running` against a profile. Callers that need a
    /// consistent view alongside a run-row insert should call this from
    /// inside their own `with_transaction` closure via `count_running_tx`.
    pub fn count_running_for_profile(&self, profile_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM loop_runs WHERE profile_id = ?1 AND status = 'running'",
                params![profile_id],
                |row| row.get(0),
            )
            .map_err(StoreError::from_sqlite)?;
        Ok(count as u32)
    }
}

pub(super) fn count_running_tx(tx: &rusqlite::Transaction<'_>, profile_id: &str) -> Result<u32, StoreError> {
    let count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM loop_runs WHERE profile_id = ?1 AND status = 'running'",
            params![profile_id],
            |row| row.get(0),
        )
        .map_err(StoreError::from_sqlite)?;
    Ok(count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Profile {
        Profile::new("p1", "default", "claude", "claude '{prompt}'")
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store.create_profile(sample()).unwrap();
        let fetched = store.get_profile("p1").unwrap();
        assert_eq!(fetched.harness, "claude");
        assert_eq!(fetched.max_concurrency, 1);
    }

    #[test]
    fn count_running_starts_at_zero() {
        let store = Store::open_in_memory().unwrap();
        store.create_profile(sample()).unwrap();
        assert_eq!(store.count_running_for_profile("p1").unwrap(), 0);
    }
}
