//! Owns the set of running [`Supervisor`]s, the shared [`Selector`], [`Store`],
//! and [`EventBus`]. Handles `up`/`down`/`kill`/`send`/`reload`/`shutdown`.
//!
//! The CLI never talks to a `Supervisor` directly: it writes queue items to
//! the shared `Store` and asks the `Runtime` (in-process) or the IPC socket
//! (cross-process) to wake the affected loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::domain::{Intent, LoopQueueItem, LoopState, IdResolver};
use crate::error::{ForgeError, Result};
use crate::selector::Selector;
use crate::store::Store;
use crate::supervisor::Supervisor;

/// How long [`Runtime::shutdown`] waits for supervisors to finish their
/// current iteration before it stops waiting on their join handles.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

struct LoopHandle {
    wake: watch::Sender<()>,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Cheap-to-clone handle owning every running loop's supervisor task.
#[derive(Clone)]
pub struct Runtime {
    store: Store,
    bus: EventBus,
    selector: Selector,
    ledger_root: PathBuf,
    handles: std::sync::Arc<std::sync::Mutex<HashMap<String, LoopHandle>>>,
}

impl Runtime {
    pub fn new(store: Store, bus: EventBus, ledger_root: PathBuf) -> Self {
        let selector = Selector::new(store.clone());
        Self {
            store,
            bus,
            selector,
            ledger_root,
            handles: std::sync::Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Spawn a supervisor task for `loop_id` if one is not already running.
    /// The task immediately observes whatever state is persisted for the
    /// loop (including `stopped`, in which case it idles until woken).
    fn ensure_handle(&self, loop_id: &str) {
        let mut handles = self.handles.lock().expect("runtime handles mutex poisoned");
        if handles.contains_key(loop_id) {
            return;
        }
        debug!(loop_id, "Runtime::ensure_handle: spawning supervisor task");
        let (wake_tx, wake_rx) = watch::channel(());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let supervisor = Supervisor::new(self.store.clone(), self.bus.clone(), self.selector.clone(), self.ledger_root.clone());
        let owned_id = loop_id.to_string();
        let join = tokio::spawn(async move {
            supervisor.run(owned_id, wake_rx, cancel_rx).await;
        });
        handles.insert(
            loop_id.to_string(),
            LoopHandle {
                wake: wake_tx,
                cancel: cancel_tx,
                join,
            },
        );
    }

    fn wake(&self, loop_id: &str) {
        let handles = self.handles.lock().expect("runtime handles mutex poisoned");
        if let Some(handle) = handles.get(loop_id) {
            let _ = handle.wake.send(());
        }
    }

    /// Called by the IPC listener on `QueueItemPending`: make sure the loop
    /// has a running supervisor and wake it immediately.
    pub fn notify_pending(&self, loop_id: &str) {
        self.ensure_handle(loop_id);
        self.wake(loop_id);
    }

    /// Resolve an operator-supplied reference (full name, full id, or an
    /// unambiguous short-id prefix of >= 4 chars) to a loop id.
    pub fn resolve_ref(&self, reference: &str) -> Result<String> {
        let loops = self.store.list_loops()?;
        let entries: HashMap<String, (String, String)> =
            loops.into_iter().map(|l| (l.id, (l.name, l.short_id))).collect();
        match IdResolver::new(&entries).resolve(reference) {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(ForgeError::NotFound("loop not found".to_string())),
            Err(candidates) => Err(ForgeError::Ambiguous {
                reference: reference.to_string(),
                candidates,
            }),
        }
    }

    /// Ensure at least `count` supervisors are actively driving loops
    /// (state != stopped). Starts loops currently `stopped`, oldest first by
    /// `created_at`, until `count` is reached or loops are exhausted.
    /// Returns the number of loops newly started.
    pub fn up(&self, count: usize) -> Result<usize> {
        info!(count, "Runtime::up: called");
        let loops = self.store.list_loops()?;
        let mut active = loops.iter().filter(|l| l.state != LoopState::Stopped).count();
        let mut started = 0;
        for loop_ in loops.into_iter().filter(|l| l.state == LoopState::Stopped) {
            if active >= count {
                break;
            }
            self.ensure_handle(&loop_.id);
            let mut loop_ = loop_;
            loop_.set_state(LoopState::Sleeping);
            self.store.update_loop(&loop_)?;
            self.wake(&loop_.id);
            active += 1;
            started += 1;
        }
        info!(started, active, "Runtime::up: done");
        Ok(started)
    }

    /// Enqueue `stop_graceful` for the loop, and wake it so a sleeping
    /// supervisor picks it up immediately rather than waiting out its
    /// interval.
    pub fn down(&self, name_or_id: &str) -> Result<()> {
        self.enqueue_intent(name_or_id, Intent::StopGraceful)
    }

    /// Enqueue `kill_now`.
    pub fn kill(&self, name_or_id: &str) -> Result<()> {
        self.enqueue_intent(name_or_id, Intent::KillNow)
    }

    /// Enqueue `pause`.
    pub fn pause(&self, name_or_id: &str) -> Result<()> {
        self.enqueue_intent(name_or_id, Intent::Pause)
    }

    /// Enqueue `message_append`.
    pub fn send(&self, name_or_id: &str, text: impl Into<String>) -> Result<()> {
        self.enqueue_intent(name_or_id, Intent::MessageAppend { text: text.into() })
    }

    /// Enqueue `next_prompt_override`.
    pub fn override_next_prompt(&self, name_or_id: &str, text: impl Into<String>) -> Result<()> {
        self.enqueue_intent(name_or_id, Intent::NextPromptOverride { text: text.into() })
    }

    fn enqueue_intent(&self, name_or_id: &str, intent: Intent) -> Result<()> {
        let loop_id = self.resolve_ref(name_or_id)?;
        debug!(loop_id, intent = intent.type_name(), "Runtime::enqueue_intent: called");
        let item = LoopQueueItem::new(Uuid::now_v7().to_string(), loop_id.clone(), intent, 0);
        self.store.enqueue(vec![item])?;
        self.ensure_handle(&loop_id);
        self.wake(&loop_id);
        Ok(())
    }

    /// Re-read persisted loop rows and reconcile the in-memory supervisor
    /// set: spawn handles for loops missing one, cancel and drop handles
    /// whose loop row no longer exists.
    pub fn reload(&self) -> Result<()> {
        info!("Runtime::reload: called");
        let current_ids: HashSet<String> = self.store.list_loops()?.into_iter().map(|l| l.id).collect();

        let stale: Vec<String> = {
            let handles = self.handles.lock().expect("runtime handles mutex poisoned");
            handles.keys().filter(|id| !current_ids.contains(*id)).cloned().collect()
        };
        for id in stale {
            debug!(loop_id = %id, "Runtime::reload: removing supervisor for deleted loop");
            let handle = self.handles.lock().expect("runtime handles mutex poisoned").remove(&id);
            if let Some(handle) = handle {
                let _ = handle.cancel.send(true);
            }
        }

        for id in current_ids {
            self.ensure_handle(&id);
        }
        Ok(())
    }

    /// Cancel every supervisor, await their termination up to `deadline`,
    /// then drop the handle map. Running harness children are interrupted
    /// the same way a `kill_now` would interrupt them.
    pub async fn shutdown(&self, deadline: Duration) {
        info!(?deadline, "Runtime::shutdown: called");
        let handles: Vec<(String, LoopHandle)> = {
            let mut map = self.handles.lock().expect("runtime handles mutex poisoned");
            map.drain().collect()
        };
        for (id, handle) in &handles {
            debug!(loop_id = %id, "Runtime::shutdown: signaling cancel");
            let _ = handle.cancel.send(true);
        }
        let joins = handles.into_iter().map(|(_, h)| h.join);
        let all = futures_join_all(joins);
        if tokio::time::timeout(deadline, all).await.is_err() {
            warn!("Runtime::shutdown: deadline elapsed before all supervisors stopped");
        }
    }
}

/// Small local stand-in for `futures::future::join_all` so this crate does
/// not need to pull in the `futures` dependency for a single call site.
async fn futures_join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
