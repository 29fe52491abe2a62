//! `Event`: an append-only record published to the bus and persisted to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Loop,
    Agent,
    Workspace,
    Queue,
    Account,
    System,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityType::Loop => "loop",
            EntityType::Agent => "agent",
            EntityType::Workspace => "workspace",
            EntityType::Queue => "queue",
            EntityType::Account => "account",
            EntityType::System => "system",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl Event {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            entity_type,
            entity_id: entity_id.into(),
            payload: None,
            metadata: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Common loop-run lifecycle event-type names, kept as constants so
/// producers and the bus's filter matching agree on exact spelling.
pub mod event_types {
    pub const LOOP_RUN_STARTED: &str = "loop_run_started";
    pub const LOOP_RUN_FINISHED: &str = "loop_run_finished";
    pub const LOOP_STATE_CHANGED: &str = "loop_state_changed";
    pub const QUEUE_ITEM_ENQUEUED: &str = "queue_item_enqueued";
}
