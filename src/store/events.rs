use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::domain::{EntityType, Event};

use super::{Store, StoreError};

fn parse_entity_type(s: &str) -> EntityType {
    match s {
        "loop" => EntityType::Loop,
        "agent" => EntityType::Agent,
        "workspace" => EntityType::Workspace,
        "queue" => EntityType::Queue,
        "account" => EntityType::Account,
        _ => EntityType::System,
    }
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let timestamp: String = row.get("timestamp")?;
    let entity_type: String = row.get("entity_type")?;
    let payload: Option<String> = row.get("payload")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(Event {
        id: row.get("id")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp).unwrap().with_timezone(&Utc),
        event_type: row.get("event_type")?,
        entity_type: parse_entity_type(&entity_type),
        entity_id: row.get("entity_id")?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

pub(super) fn insert_event_tx(tx: &rusqlite::Transaction<'_>, event: &Event) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO events (id, timestamp, event_type, entity_type, entity_id, payload, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            event.id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type.to_string(),
            event.entity_id,
            event.payload.as_ref().map(serde_json::to_string).transpose()?,
            event.metadata.as_ref().map(serde_json::to_string).transpose()?,
        ],
    )
    .map_err(StoreError::from_sqlite)?;
    Ok(())
}

impl Store {
    /// Append an event. Events are never mutated or deleted after insertion.
    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        debug!(id = %event.id, event_type = %event.event_type, "Store::append_event: called");
        self.with_transaction(|tx| insert_event_tx(tx, event))
    }

    pub fn list_events_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM events WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY timestamp ASC")
            .map_err(StoreError::from_sqlite)?;
        let rows = stmt
            .query_map(params![entity_type.to_string(), entity_id], row_to_event)
            .map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_list_for_entity() {
        let store = Store::open_in_memory().unwrap();
        let event = Event::new("e1", "loop_run_started", EntityType::Loop, "loop-1");
        store.append_event(&event).unwrap();
        let events = store.list_events_for_entity(EntityType::Loop, "loop-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "loop_run_started");
    }

    #[test]
    fn no_subscriber_style_query_on_empty_entity_is_empty() {
        let store = Store::open_in_memory().unwrap();
        let events = store.list_events_for_entity(EntityType::Loop, "missing").unwrap();
        assert!(events.is_empty());
    }
}
