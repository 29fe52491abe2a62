//! The `Loop` record: a persistent, named, restartable background worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Sleeping,
    Waiting,
    Running,
    Error,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Stopped => write!(f, "stopped"),
            LoopState::Sleeping => write!(f, "sleeping"),
            LoopState::Waiting => write!(f, "waiting"),
            LoopState::Running => write!(f, "running"),
            LoopState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub repo_path: String,
    pub base_prompt_path: Option<String>,
    pub base_prompt_msg: Option<String>,
    pub pool_id: Option<String>,
    pub profile_id: Option<String>,
    pub interval_seconds: u64,
    pub state: LoopState,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub log_path: Option<String>,
    pub ledger_path: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loop {
    pub fn new(id: impl Into<String>, short_id: impl Into<String>, name: impl Into<String>, repo_path: impl Into<String>) -> Self {
        let ts = now();
        let rec = Self {
            id: id.into(),
            short_id: short_id.into(),
            name: name.into(),
            repo_path: repo_path.into(),
            base_prompt_path: None,
            base_prompt_msg: None,
            pool_id: None,
            profile_id: None,
            interval_seconds: 60,
            state: LoopState::Stopped,
            last_run_at: None,
            last_exit_code: None,
            last_error: None,
            log_path: None,
            ledger_path: None,
            tags: Vec::new(),
            metadata: serde_json::json!({}),
            created_at: ts,
            updated_at: ts,
        };
        debug!(id = %rec.id, name = %rec.name, "Loop::new: created");
        rec
    }

    pub fn with_base_prompt_msg(mut self, msg: impl Into<String>) -> Self {
        self.base_prompt_msg = Some(msg.into());
        self.updated_at = now();
        self
    }

    pub fn with_base_prompt_path(mut self, path: impl Into<String>) -> Self {
        self.base_prompt_path = Some(path.into());
        self.updated_at = now();
        self
    }

    pub fn with_interval_seconds(mut self, secs: u64) -> Self {
        self.interval_seconds = secs;
        self.updated_at = now();
        self
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self.updated_at = now();
        self
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self.updated_at = now();
        self
    }

    pub fn set_state(&mut self, state: LoopState) {
        debug!(id = %self.id, ?state, "Loop::set_state: called");
        self.state = state;
        self.updated_at = now();
    }

    pub fn set_last_run(&mut self, exit_code: Option<i32>, error: Option<String>) {
        debug!(id = %self.id, ?exit_code, "Loop::set_last_run: called");
        self.last_run_at = Some(now());
        self.last_exit_code = exit_code;
        self.last_error = error;
        self.updated_at = now();
    }

    pub fn is_runnable(&self) -> bool {
        self.base_prompt_msg.is_some() || self.base_prompt_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_loop_defaults_to_stopped() {
        let l = Loop::new("id-1", "ab12cd34", "demo", "/repo");
        assert_eq!(l.state, LoopState::Stopped);
        assert!(!l.is_runnable());
    }

    #[test]
    fn builder_chain_sets_fields_and_bumps_updated_at() {
        let before = Loop::new("id-1", "ab12cd34", "demo", "/repo");
        let after = before
            .clone()
            .with_base_prompt_msg("do the thing")
            .with_interval_seconds(30)
            .with_pool("pool-1");
        assert_eq!(after.base_prompt_msg.as_deref(), Some("do the thing"));
        assert_eq!(after.interval_seconds, 30);
        assert_eq!(after.pool_id.as_deref(), Some("pool-1"));
        assert!(after.is_runnable());
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn set_state_mutates_in_place() {
        let mut l = Loop::new("id-1", "ab12cd34", "demo", "/repo");
        l.set_state(LoopState::Sleeping);
        assert_eq!(l.state, LoopState::Sleeping);
    }
}
