//! In-process publish/subscribe for [`Event`](crate::domain::Event), with
//! per-subscriber filtering and bounded, isolated delivery so one slow or
//! panicking handler cannot stall another subscriber or the publisher.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::domain::{EntityType, Event};

/// Default broadcast buffer: at a modest event rate this gives a generous
/// window before a lagging subscriber starts missing events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Per-subscriber forwarding channel bound; beyond this the forwarder drops
/// events for that subscriber and increments its drop counter rather than
/// blocking the publisher.
pub const DEFAULT_SUBSCRIBER_BOUND: usize = 256;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("subscriber id {0:?} is already registered")]
    DuplicateSubscriber(String),
}

/// Matches an [`Event`] against a subscription's interest. An empty list for
/// any field means "match anything" (wildcard).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub event_types: Vec<String>,
    pub entity_types: Vec<EntityType>,
    pub entity_id: Option<String>,
}

impl Filter {
    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| t == &event.event_type) {
            return false;
        }
        if !self.entity_types.is_empty() && !self.entity_types.contains(&event.entity_type) {
            return false;
        }
        if let Some(id) = &self.entity_id {
            if id != &event.entity_id {
                return false;
            }
        }
        true
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unregisters the
/// subscriber id.
pub struct Subscription {
    pub id: String,
    pub rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    ids: Arc<Mutex<HashSet<String>>>,
}

impl Subscription {
    /// Count of events dropped for this subscriber because its bounded
    /// channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.ids.lock().expect("bus ids mutex poisoned").remove(&self.id);
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    subscriber_ids: Arc<Mutex<HashSet<String>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            subscriber_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget publish. A send with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        debug!(event_type = %event.event_type, entity_id = %event.entity_id, "EventBus::publish: called");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Register a named, filtered subscription. `id` must be unique among
    /// currently-live subscriptions (prevents duplicate hook installs).
    pub fn subscribe(&self, id: impl Into<String>, filter: Filter) -> Result<Subscription, EventBusError> {
        let id = id.into();
        {
            let mut ids = self.subscriber_ids.lock().expect("bus ids mutex poisoned");
            if !ids.insert(id.clone()) {
                return Err(EventBusError::DuplicateSubscriber(id));
            }
        }
        debug!(%id, "EventBus::subscribe: registered");

        let mut broadcast_rx = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_BOUND);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_for_task = dropped.clone();
        let sub_id = id.clone();

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => {
                        if !filter.matches(&event) {
                            continue;
                        }
                        if tx.try_send(event).is_err() {
                            let total = dropped_for_task.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(subscriber = %sub_id, total, "EventBus: subscriber channel full, dropping event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subscriber = %sub_id, skipped, "EventBus: subscriber lagged on broadcast channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription {
            id,
            rx,
            dropped,
            ids: self.subscriber_ids.clone(),
        })
    }
}

/// Cheap-to-clone convenience wrapper scoping publishes to one loop id.
#[derive(Clone)]
pub struct EventEmitter {
    bus: EventBus,
    loop_id: String,
}

impl EventEmitter {
    pub fn new(bus: EventBus, loop_id: impl Into<String>) -> Self {
        Self { bus, loop_id: loop_id.into() }
    }

    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }

    pub fn emit(&self, event_type: &str, payload: Option<serde_json::Value>) {
        let mut event = Event::new(uuid::Uuid::now_v7().to_string(), event_type, EntityType::Loop, self.loop_id.clone());
        event.payload = payload;
        self.bus.publish(event);
    }

    pub fn loop_run_started(&self, run_id: &str) {
        self.emit(crate::domain::event::event_types::LOOP_RUN_STARTED, Some(serde_json::json!({"run_id": run_id})));
    }

    pub fn loop_run_finished(&self, run_id: &str, status: &str, exit_code: Option<i32>) {
        self.emit(
            crate::domain::event::event_types::LOOP_RUN_FINISHED,
            Some(serde_json::json!({"run_id": run_id, "status": status, "exit_code": exit_code})),
        );
    }

    pub fn loop_state_changed(&self, state: &str) {
        self.emit(crate::domain::event::event_types::LOOP_STATE_CHANGED, Some(serde_json::json!({"state": state})));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::with_default_capacity();
        bus.publish(Event::new("e1", "loop_run_started", EntityType::Loop, "loop-1"));
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events_only() {
        let bus = EventBus::with_default_capacity();
        let mut sub = bus
            .subscribe(
                "sub-1",
                Filter {
                    event_types: vec!["loop_run_started".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        bus.publish(Event::new("e1", "loop_run_started", EntityType::Loop, "loop-1"));
        bus.publish(Event::new("e2", "loop_run_finished", EntityType::Loop, "loop-1"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let received = sub.rx.try_recv().unwrap();
        assert_eq!(received.event_type, "loop_run_started");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_subscriber_id_is_rejected() {
        let bus = EventBus::with_default_capacity();
        let _sub = bus.subscribe("sub-1", Filter::default()).unwrap();
        let err = bus.subscribe("sub-1", Filter::default()).unwrap_err();
        assert!(matches!(err, EventBusError::DuplicateSubscriber(_)));
    }

    #[tokio::test]
    async fn dropping_subscription_frees_its_id() {
        let bus = EventBus::with_default_capacity();
        {
            let _sub = bus.subscribe("sub-1", Filter::default()).unwrap();
        }
        let _sub = bus.subscribe("sub-1", Filter::default()).unwrap();
    }

    #[tokio::test]
    async fn entity_id_filter_narrows_to_one_loop() {
        let bus = EventBus::with_default_capacity();
        let mut sub = bus
            .subscribe(
                "sub-1",
                Filter {
                    entity_id: Some("loop-1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        bus.publish(Event::new("e1", "x", EntityType::Loop, "loop-2"));
        bus.publish(Event::new("e2", "x", EntityType::Loop, "loop-1"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let received = sub.rx.try_recv().unwrap();
        assert_eq!(received.entity_id, "loop-1");
    }
}
