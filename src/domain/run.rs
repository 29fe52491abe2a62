//! `LoopRun`: the record of a single iteration of a loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    Base,
    Override,
    Steer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopRun {
    pub id: String,
    pub loop_id: String,
    pub profile_id: Option<String>,
    pub status: RunStatus,
    pub prompt_source: PromptSource,
    pub prompt_path: Option<String>,
    pub prompt_override: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output_tail: String,
    pub metadata: serde_json::Value,
}

impl LoopRun {
    pub fn start(id: impl Into<String>, loop_id: impl Into<String>, profile_id: Option<String>, prompt_source: PromptSource) -> Self {
        let rec = Self {
            id: id.into(),
            loop_id: loop_id.into(),
            profile_id,
            status: RunStatus::Running,
            prompt_source,
            prompt_path: None,
            prompt_override: matches!(prompt_source, PromptSource::Override),
            started_at: now(),
            finished_at: None,
            exit_code: None,
            output_tail: String::new(),
            metadata: serde_json::json!({}),
        };
        debug!(id = %rec.id, loop_id = %rec.loop_id, "LoopRun::start: created");
        rec
    }

    pub fn finish(&mut self, status: RunStatus, exit_code: Option<i32>, output_tail: String) {
        debug!(id = %self.id, ?status, ?exit_code, "LoopRun::finish: called");
        assert!(status.is_terminal(), "finish() requires a terminal status");
        self.status = status;
        self.exit_code = exit_code;
        self.output_tail = output_tail;
        self.finished_at = Some(now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_at_unset_while_running() {
        let run = LoopRun::start("r1", "l1", None, PromptSource::Base);
        assert!(run.finished_at.is_none());
        assert!(!run.is_terminal());
    }

    #[test]
    fn finish_sets_finished_at_and_terminal_status() {
        let mut run = LoopRun::start("r1", "l1", None, PromptSource::Base);
        run.finish(RunStatus::Success, Some(0), "ok\n".to_string());
        assert!(run.finished_at.is_some());
        assert_eq!(run.exit_code, Some(0));
        assert!(run.is_terminal());
    }

    #[test]
    #[should_panic]
    fn finish_rejects_running_status() {
        let mut run = LoopRun::start("r1", "l1", None, PromptSource::Base);
        run.finish(RunStatus::Running, None, String::new());
    }

    #[test]
    fn override_source_sets_prompt_override_flag() {
        let run = LoopRun::start("r1", "l1", None, PromptSource::Override);
        assert!(run.prompt_override);
    }
}
