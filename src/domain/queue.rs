//! `LoopQueueItem`: the per-loop ordered stream of control intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Skipped,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::Failed | QueueItemStatus::Skipped)
    }
}

/// A typed control intent. Mirrors the `type` + free-form `payload` split in
/// the persisted row, but is the in-memory shape the supervisor matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    MessageAppend { text: String },
    NextPromptOverride { text: String },
    Pause,
    StopGraceful,
    KillNow,
    SteerMessage { text: String },
}

impl Intent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Intent::MessageAppend { .. } => "message_append",
            Intent::NextPromptOverride { .. } => "next_prompt_override",
            Intent::Pause => "pause",
            Intent::StopGraceful => "stop_graceful",
            Intent::KillNow => "kill_now",
            Intent::SteerMessage { .. } => "steer_message",
        }
    }

    /// Whether this intent halts iteration when encountered while draining
    /// the queue (as opposed to a prompt-modifying intent, which is merely
    /// accumulated).
    pub fn is_control_terminal(&self) -> bool {
        matches!(self, Intent::Pause | Intent::StopGraceful | Intent::KillNow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopQueueItem {
    pub id: String,
    pub loop_id: String,
    pub intent: Intent,
    pub position: i64,
    pub status: QueueItemStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LoopQueueItem {
    pub fn new(id: impl Into<String>, loop_id: impl Into<String>, intent: Intent, position: i64) -> Self {
        Self {
            id: id.into(),
            loop_id: loop_id.into(),
            intent,
            position,
            status: QueueItemStatus::Pending,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
        }
    }

    pub fn dispatch(&mut self) {
        debug!(id = %self.id, "LoopQueueItem::dispatch: called");
        self.status = QueueItemStatus::Dispatched;
        self.attempts += 1;
        self.dispatched_at = Some(Utc::now());
    }

    pub fn complete(&mut self, status: QueueItemStatus, error: Option<String>) {
        debug!(id = %self.id, ?status, "LoopQueueItem::complete: called");
        assert!(status.is_terminal(), "complete() requires a terminal status");
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue item not found: {0}")]
    NotFound(String),

    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition { from: QueueItemStatus, to: QueueItemStatus },

    #[error("reorder set does not match the loop's pending items")]
    ReorderMismatch,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Validates a status transition per the allowed state machine:
/// `pending -> dispatched -> {completed, failed, skipped}`.
pub fn validate_transition(from: QueueItemStatus, to: QueueItemStatus) -> Result<(), QueueError> {
    let allowed = matches!(
        (from, to),
        (QueueItemStatus::Pending, QueueItemStatus::Dispatched)
            | (QueueItemStatus::Dispatched, QueueItemStatus::Completed)
            | (QueueItemStatus::Dispatched, QueueItemStatus::Failed)
            | (QueueItemStatus::Dispatched, QueueItemStatus::Skipped)
    );
    if allowed {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_dispatched_is_allowed() {
        assert!(validate_transition(QueueItemStatus::Pending, QueueItemStatus::Dispatched).is_ok());
    }

    #[test]
    fn dispatched_to_completed_is_allowed() {
        assert!(validate_transition(QueueItemStatus::Dispatched, QueueItemStatus::Completed).is_ok());
    }

    #[test]
    fn pending_to_completed_is_rejected() {
        assert!(validate_transition(QueueItemStatus::Pending, QueueItemStatus::Completed).is_err());
    }

    #[test]
    fn completed_to_dispatched_is_rejected() {
        assert!(validate_transition(QueueItemStatus::Completed, QueueItemStatus::Dispatched).is_err());
    }

    #[test]
    fn kill_now_and_stop_graceful_are_control_terminal() {
        assert!(Intent::KillNow.is_control_terminal());
        assert!(Intent::StopGraceful.is_control_terminal());
        assert!(Intent::Pause.is_control_terminal());
        assert!(!Intent::MessageAppend { text: "hi".into() }.is_control_terminal());
    }

    #[test]
    fn intent_serde_tag_matches_type_name() {
        let intent = Intent::MessageAppend { text: "hi".into() };
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["type"], "message_append");
        assert_eq!(intent.type_name(), "message_append");
    }

    #[test]
    fn dispatch_then_complete_sets_timestamps() {
        let mut item = LoopQueueItem::new("q1", "l1", Intent::Pause, 1);
        assert!(item.dispatched_at.is_none());
        item.dispatch();
        assert!(item.dispatched_at.is_some());
        item.complete(QueueItemStatus::Completed, None);
        assert!(item.completed_at.is_some());
    }
}
