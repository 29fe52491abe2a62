//! Per-loop state machine: sleep -> resolve prompt -> apply queue -> run ->
//! ledger -> sleep. One [`Supervisor::run`] task per running loop.

mod drain;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use drain::{drain_pending, resolve_prompt, Drain};

use crate::bus::{EventBus, EventEmitter};
use crate::domain::{
    event::event_types, EntityType, Event, Intent, Loop, LoopState, LoopRun, PromptSource, QueueItemStatus, RunStatus,
};
use crate::runner::{Outcome, Runner, RunRequest};
use crate::selector::Selector;
use crate::store::Store;

const MAX_BACKOFF_SECS: u64 = 60;

pub struct Supervisor {
    store: Store,
    bus: EventBus,
    selector: Selector,
    runner: Runner,
    ledger_root: PathBuf,
}

impl Supervisor {
    pub fn new(store: Store, bus: EventBus, selector: Selector, ledger_root: PathBuf) -> Self {
        Self {
            store,
            bus,
            selector,
            runner: Runner::new(),
            ledger_root,
        }
    }

    /// Drive `loop_id` until `cancel` is set to `true`. `wake` is notified on
    /// new queue items or explicit start/resume so sleeping loops react
    /// immediately instead of waiting out their poll interval.
    pub async fn run(&self, loop_id: String, mut wake: watch::Receiver<()>, mut cancel: watch::Receiver<bool>) {
        info!(%loop_id, "Supervisor::run: starting");
        let mut backoff_secs: u64 = 1;

        loop {
            if *cancel.borrow() {
                break;
            }

            let loop_ = match self.store.get_loop(&loop_id) {
                Ok(l) => l,
                Err(e) => {
                    error!(%loop_id, error = %e, "Supervisor::run: loop disappeared, stopping");
                    break;
                }
            };

            if loop_.state == LoopState::Stopped {
                tokio::select! {
                    _ = wake.changed() => continue,
                    _ = cancel.changed() => { if *cancel.borrow() { break; } }
                }
                continue;
            }

            self.set_state(&loop_id, LoopState::Sleeping);
            let interval = Duration::from_secs(loop_.interval_seconds.max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.changed() => {}
                _ = cancel.changed() => {}
            }
            if *cancel.borrow() {
                break;
            }

            match self.run_one_iteration(&loop_id).await {
                Ok(IterationOutcome::Continued) => {
                    backoff_secs = 1;
                }
                Ok(IterationOutcome::Stopped) => {
                    self.set_state(&loop_id, LoopState::Stopped);
                }
                Ok(IterationOutcome::Paused) => {
                    self.set_state(&loop_id, LoopState::Waiting);
                    tokio::select! {
                        _ = wake.changed() => {}
                        _ = cancel.changed() => {}
                    }
                }
                Ok(IterationOutcome::Skipped) => {
                    backoff_secs = 1;
                }
                Ok(IterationOutcome::Unavailable) => {
                    self.set_state(&loop_id, LoopState::Waiting);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        _ = wake.changed() => {}
                        _ = cancel.changed() => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
                Err(e) => {
                    warn!(%loop_id, error = %e, backoff_secs, "Supervisor::run: transient failure, backing off");
                    self.set_state(&loop_id, LoopState::Error);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        _ = cancel.changed() => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
        info!(%loop_id, "Supervisor::run: stopped");
    }

    fn set_state(&self, loop_id: &str, state: LoopState) {
        if let Ok(mut loop_) = self.store.get_loop(loop_id) {
            loop_.set_state(state);
            let _ = self.store.update_loop(&loop_);
        }
    }

    /// While a run is in flight, `kill_now` only reaches the supervisor as a
    /// queue row — this polls for one and signals `cancel_tx` the moment it
    /// appears, so the Runner's own cancellation path (already wired to
    /// `cancel_tx`'s receiver) tears down the in-flight child instead of only
    /// stopping the *next* iteration from starting. The item itself is left
    /// pending: the next iteration's drain sees it, halts, and transitions
    /// the loop to `stopped`, the same as any other `kill_now`.
    fn spawn_kill_watch(&self, loop_id: &str, cancel_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let loop_id = loop_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let Ok(pending) = store.pending_items(&loop_id) else { continue };
                if pending.iter().any(|item| item.intent == Intent::KillNow) {
                    let _ = cancel_tx.send(true);
                    break;
                }
            }
        })
    }

    /// Drain pending queue items, resolve the iteration's prompt, select a
    /// profile, run the harness, and commit the run + ledger + event.
    async fn run_one_iteration(&self, loop_id: &str) -> Result<IterationOutcome, crate::error::ForgeError> {
        let mut loop_ = self.store.get_loop(loop_id)?;
        let emitter = EventEmitter::new(self.bus.clone(), loop_id.to_string());

        let pending = self.store.pending_items(loop_id)?;
        let drain = drain_pending(&pending);

        if let Some(halt) = &drain.halt {
            for id in &drain.to_complete {
                self.store.complete_drained_item(id, None)?;
            }
            return match halt {
                crate::domain::Intent::KillNow => Ok(IterationOutcome::Stopped),
                crate::domain::Intent::StopGraceful => Ok(IterationOutcome::Stopped),
                crate::domain::Intent::Pause => Ok(IterationOutcome::Paused),
                _ => unreachable!("drain only halts on control-terminal intents"),
            };
        }

        let base_text = match (&loop_.base_prompt_msg, &loop_.base_prompt_path) {
            (Some(msg), _) => Some(msg.clone()),
            (None, Some(path)) => std::fs::read_to_string(path).ok(),
            (None, None) => None,
        };

        let Some((prompt, source)) = resolve_prompt(base_text, &drain) else {
            loop_.set_last_run(None, Some("no prompt source".to_string()));
            loop_.set_state(LoopState::Error);
            self.store.update_loop(&loop_)?;
            return Ok(IterationOutcome::Skipped);
        };

        // Profile availability is checked before the drained items are
        // marked completed: on `Unavailable` the prompt modifications must
        // still be pending for the retry, per the Supervisor's retry
        // contract.
        let profile = match self.selector.select(&loop_) {
            Ok(p) => p,
            Err(crate::selector::SelectorError::Unavailable) => return Ok(IterationOutcome::Unavailable),
            Err(e) => return Err(e.into()),
        };

        for id in &drain.to_complete {
            self.store.complete_drained_item(id, None)?;
        }

        self.set_state(loop_id, LoopState::Running);

        let run_id = Uuid::now_v7().to_string();
        let run = LoopRun::start(run_id.clone(), loop_id.to_string(), Some(profile.id.clone()), source);
        let run = self.store.start_run(run, Some(profile.max_concurrency))?;
        emitter.loop_run_started(&run.id);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let kill_watch = self.spawn_kill_watch(loop_id, cancel_tx);
        let workdir = PathBuf::from(&loop_.repo_path);
        let log_path = loop_.log_path.as_ref().map(PathBuf::from);
        let result = self
            .runner
            .run(RunRequest {
                profile: &profile,
                prompt: &prompt,
                prompt_path: None,
                workdir: &workdir,
                timeout: None,
                log_path: log_path.as_deref(),
                cancel: cancel_rx,
            })
            .await;
        kill_watch.abort();

        let mut run = run;
        let (status, exit_code, tail) = match result {
            Ok(outcome) => {
                let status = match outcome.outcome {
                    Outcome::Success => RunStatus::Success,
                    Outcome::Error => RunStatus::Error,
                    Outcome::Killed => RunStatus::Killed,
                };
                (status, outcome.exit_code, outcome.output_tail)
            }
            Err(e) => (RunStatus::Error, None, e.to_string()),
        };
        run.finish(status, exit_code, tail);
        self.store.finish_run(&run)?;

        let ledger_path = loop_
            .ledger_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.ledger_root.join(format!("{}.md", loop_.name)));
        if let Err(e) = crate::ledger::append_entry(&ledger_path, &run, &profile.name) {
            warn!(%loop_id, error = %e, "Supervisor::run_one_iteration: ledger write failed");
        }

        loop_.set_last_run(run.exit_code, if status == RunStatus::Success { None } else { Some(format!("{status}")) });
        let event = Event::new(Uuid::now_v7().to_string(), event_types::LOOP_RUN_FINISHED, EntityType::Loop, loop_id.to_string())
            .with_payload(serde_json::json!({"run_id": run.id, "status": status.to_string(), "exit_code": run.exit_code}));
        self.store.update_loop_with_event(&loop_, &event)?;
        emitter.loop_run_finished(&run.id, &status.to_string(), run.exit_code);

        Ok(IterationOutcome::Continued)
    }
}

enum IterationOutcome {
    Continued,
    Stopped,
    Paused,
    Skipped,
    /// No profile had a free concurrency slot this tick; retried with
    /// backoff, queue items left untouched.
    Unavailable,
}
