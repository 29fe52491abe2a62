//! The `forge` CLI: a thin client over the shared [`Store`], plus the
//! foreground `up` command that owns the live [`Runtime`] and serves the IPC
//! socket.
//!
//! Every command except `up` only ever writes to the Store and best-effort
//! notifies a running daemon via [`ipc::notify`] — it never talks to a live
//! `Supervisor` in this process.

mod args;

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

pub use args::{Cli, Command, LoopCommand, PoolCommand, ProfileCommand};

use crate::bus::EventBus;
use crate::config::Config;
use crate::domain::{IdResolver, Intent, Loop, LoopQueueItem, Pool, PoolMember, Profile};
use crate::error::{ForgeError, Result};
use crate::ipc::{self, DaemonMessage, DaemonResponse};
use crate::runtime::Runtime;
use crate::store::Store;

/// Exit code for a dispatched command's result, per the contract in the
/// CLI spec: 0 success, 1 user error, 2 internal error.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(ForgeError::NotFound(_) | ForgeError::Ambiguous { .. } | ForgeError::Validation(_)) => 1,
        Err(_) => 2,
    }
}

/// The message the CLI prints for a failed command. `NotFound`/`Ambiguous`
/// carry the exact operator-facing text this layer is required to print
/// ("loop not found", "ambiguous loop"); everything else falls back to the
/// error's `Display`.
pub fn user_facing_message(err: &ForgeError) -> String {
    match err {
        ForgeError::NotFound(msg) => msg.clone(),
        ForgeError::Ambiguous { .. } => "ambiguous loop".to_string(),
        ForgeError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn resolve_loop(store: &Store, reference: &str) -> Result<String> {
    let loops = store.list_loops()?;
    let entries: HashMap<String, (String, String)> = loops.into_iter().map(|l| (l.id, (l.name, l.short_id))).collect();
    match IdResolver::new(&entries).resolve(reference) {
        Ok(Some(id)) => Ok(id),
        Ok(None) => Err(ForgeError::NotFound("loop not found".to_string())),
        Err(candidates) => Err(ForgeError::Ambiguous {
            reference: reference.to_string(),
            candidates,
        }),
    }
}

fn find_profile_by_name(store: &Store, name: &str) -> Result<Profile> {
    store
        .list_profiles()?
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ForgeError::NotFound(format!("profile {name}")))
}

fn find_pool_by_name(store: &Store, name: &str) -> Result<Pool> {
    store
        .list_pools()?
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ForgeError::NotFound(format!("pool {name}")))
}

/// Enqueue `intent` against the resolved loop, then best-effort wake a
/// running daemon so it doesn't wait out its poll interval.
async fn enqueue_and_notify(store: &Store, socket_path: &Path, name: &str, intent: Intent) -> Result<()> {
    let loop_id = resolve_loop(store, name)?;
    let item = LoopQueueItem::new(Uuid::now_v7().to_string(), loop_id.clone(), intent, 0);
    store.enqueue(vec![item])?;
    match ipc::notify(socket_path, DaemonMessage::QueueItemPending { loop_id }).await {
        Some(DaemonResponse::Ok) => info!("daemon acknowledged"),
        _ => info!("no daemon reachable, relying on poll fallback"),
    }
    Ok(())
}

pub async fn dispatch(cli: Cli, config: &Config) -> Result<()> {
    let store = Store::open(&config.store_path)?;

    match cli.command {
        Command::Up { count } => cmd_up(&store, config, count).await,
        Command::Down { name } => enqueue_and_notify(&store, &config.socket_path, &name, Intent::StopGraceful).await,
        Command::Kill { name } => enqueue_and_notify(&store, &config.socket_path, &name, Intent::KillNow).await,
        Command::Msg { name, text } => enqueue_and_notify(&store, &config.socket_path, &name, Intent::MessageAppend { text }).await,
        Command::OverridePrompt { name, text } => {
            enqueue_and_notify(&store, &config.socket_path, &name, Intent::NextPromptOverride { text }).await
        }
        Command::Pause { name } => enqueue_and_notify(&store, &config.socket_path, &name, Intent::Pause).await,
        Command::Logs { name, follow } => cmd_logs(&store, &name, follow).await,
        Command::Ledger { name } => cmd_ledger(&store, &name),
        Command::Loop { command } => cmd_loop(&store, config, command),
        Command::Profile { command } => cmd_profile(&store, config, command),
        Command::Pool { command } => cmd_pool(&store, command),
    }
}

/// Bring `count` loops up and serve the IPC socket in the foreground until
/// interrupted. This is the daemon process in this single-binary design.
async fn cmd_up(store: &Store, config: &Config, count: usize) -> Result<()> {
    config.bootstrap.apply(store)?;

    let bus = EventBus::with_default_capacity();
    let runtime = Runtime::new(store.clone(), bus, config.ledger_root.clone());
    let started = runtime.up(count)?;
    println!("started {started} loop(s)");

    let listener = ipc::bind(&config.socket_path).map_err(ForgeError::Io)?;
    info!(socket = %config.socket_path.display(), "forge up: serving IPC socket");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(ForgeError::Io)?;
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    let result = ipc::handle_connection(stream, |msg| match msg {
                        DaemonMessage::QueueItemPending { loop_id } => {
                            runtime.notify_pending(&loop_id);
                            DaemonResponse::Ok
                        }
                        DaemonMessage::Ping => DaemonResponse::Pong { version: env!("CARGO_PKG_VERSION").to_string() },
                        DaemonMessage::Shutdown => DaemonResponse::Ok,
                    })
                    .await;
                    if let Err(e) = result {
                        warn!(error = %e, "forge up: connection handling failed");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("forge up: received interrupt, shutting down");
                break;
            }
        }
    }

    runtime.shutdown(std::time::Duration::from_secs(30)).await;
    Ok(())
}

async fn cmd_logs(store: &Store, name: &str, follow: bool) -> Result<()> {
    let loop_id = resolve_loop(store, name)?;
    let loop_ = store.get_loop(&loop_id)?;
    let Some(log_path) = loop_.log_path else {
        println!("loop {name} has no log file configured");
        return Ok(());
    };
    let mut pos = print_tail(&log_path)?;
    if !follow {
        return Ok(());
    }
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        pos = print_from(&log_path, pos)?;
    }
}

fn print_tail(path: &str) -> Result<u64> {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    print!("{contents}");
    Ok(contents.len() as u64)
}

fn print_from(path: &str, pos: u64) -> Result<u64> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(pos),
    };
    file.seek(SeekFrom::Start(pos)).map_err(ForgeError::Io)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).map_err(ForgeError::Io)?;
    print!("{buf}");
    Ok(pos + buf.len() as u64)
}

fn cmd_ledger(store: &Store, name: &str) -> Result<()> {
    let loop_id = resolve_loop(store, name)?;
    let loop_ = store.get_loop(&loop_id)?;
    let Some(ledger_path) = loop_.ledger_path else {
        println!("loop {name} has no ledger file configured");
        return Ok(());
    };
    let contents = std::fs::read_to_string(&ledger_path).map_err(ForgeError::Io)?;
    print!("{contents}");
    Ok(())
}

fn cmd_loop(store: &Store, config: &Config, command: LoopCommand) -> Result<()> {
    match command {
        LoopCommand::Create {
            name,
            repo_path,
            prompt,
            prompt_path,
            profile,
            pool,
            interval_seconds,
        } => {
            let interval_seconds = interval_seconds.unwrap_or(config.poll_fallback_interval_secs);
            let mut loop_ = Loop::new(Uuid::now_v7().to_string(), "", name, repo_path).with_interval_seconds(interval_seconds);
            if let Some(text) = prompt {
                loop_ = loop_.with_base_prompt_msg(text);
            }
            if let Some(path) = prompt_path {
                loop_ = loop_.with_base_prompt_path(path);
            }
            if let Some(profile_name) = profile {
                let profile = find_profile_by_name(store, &profile_name)?;
                loop_ = loop_.with_profile(profile.id);
            }
            if let Some(pool_name) = pool {
                let pool = find_pool_by_name(store, &pool_name)?;
                loop_ = loop_.with_pool(pool.id);
            }
            let created = store.create_loop(loop_)?;
            println!("created loop {} ({})", created.name, created.short_id);
            Ok(())
        }
        LoopCommand::List => {
            for loop_ in store.list_loops()? {
                println!("{}\t{}\t{}\t{}", loop_.short_id, loop_.name, loop_.state, loop_.repo_path);
            }
            Ok(())
        }
        LoopCommand::Rm { name } => {
            let loop_id = resolve_loop(store, &name)?;
            store.delete_loop(&loop_id)?;
            println!("removed loop {name}");
            Ok(())
        }
    }
}

fn cmd_profile(store: &Store, config: &Config, command: ProfileCommand) -> Result<()> {
    match command {
        ProfileCommand::Init => {
            std::fs::create_dir_all(".forge/prompts").map_err(ForgeError::Io)?;
            let yaml_path = std::path::Path::new(".forge/forge.yaml");
            if !yaml_path.exists() {
                let yaml = serde_yaml::to_string(&Config::default()).map_err(|e| ForgeError::Validation(e.to_string()))?;
                std::fs::write(yaml_path, yaml).map_err(ForgeError::Io)?;
            }
            println!("initialized .forge/ (store at {})", config.store_path.display());
            Ok(())
        }
        ProfileCommand::Add {
            name,
            harness,
            command_template,
            model,
            max_concurrency,
        } => {
            let mut profile = Profile::new(Uuid::now_v7().to_string(), name, harness, command_template).with_max_concurrency(max_concurrency);
            profile.model = model;
            let created = store.create_profile(profile)?;
            println!("created profile {}", created.name);
            Ok(())
        }
        ProfileCommand::List => {
            for profile in store.list_profiles()? {
                println!("{}\t{}\t{}\tconcurrency={}", profile.id, profile.name, profile.harness, profile.max_concurrency);
            }
            Ok(())
        }
        ProfileCommand::Rm { name } => {
            let profile = find_profile_by_name(store, &name)?;
            store.delete_profile(&profile.id)?;
            println!("removed profile {name}");
            Ok(())
        }
    }
}

fn cmd_pool(store: &Store, command: PoolCommand) -> Result<()> {
    match command {
        PoolCommand::Create { name } => {
            let created = store.create_pool(Pool::new(Uuid::now_v7().to_string(), name))?;
            println!("created pool {}", created.name);
            Ok(())
        }
        PoolCommand::Add { pool, profile, weight } => {
            let pool = find_pool_by_name(store, &pool)?;
            let profile = find_profile_by_name(store, &profile)?;
            let position = store.list_pool_members(&pool.id)?.len() as i64 + 1;
            store.add_pool_member(PoolMember {
                pool_id: pool.id,
                profile_id: profile.id,
                weight,
                position,
            })?;
            println!("added {} to pool {}", profile.name, pool.name);
            Ok(())
        }
        PoolCommand::SetDefault { name } => {
            let pool = find_pool_by_name(store, &name)?;
            store.set_default_pool(&pool.id)?;
            println!("pool {name} is now default");
            Ok(())
        }
        PoolCommand::List => {
            for pool in store.list_pools()? {
                let members = store.list_pool_members(&pool.id)?;
                println!("{}\t{}\tdefault={}\tmembers={}", pool.id, pool.name, pool.is_default, members.len());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_loop(name: &str, short_id: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_loop(Loop::new(format!("id-{name}"), short_id, name, "/repo")).unwrap();
        store
    }

    #[test]
    fn resolve_loop_by_exact_name() {
        let store = store_with_loop("demo", "ab12cd34");
        let id = resolve_loop(&store, "demo").unwrap();
        assert_eq!(id, "id-demo");
    }

    #[test]
    fn resolve_loop_missing_is_loop_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = resolve_loop(&store, "nope").unwrap_err();
        assert_eq!(user_facing_message(&err), "loop not found");
        assert_eq!(exit_code(&Err(err)), 1);
    }

    #[test]
    fn resolve_loop_ambiguous_prefix_is_ambiguous_loop() {
        let store = Store::open_in_memory().unwrap();
        store.create_loop(Loop::new("id-a", "ab111111", "a", "/repo")).unwrap();
        store.create_loop(Loop::new("id-b", "ab222222", "b", "/repo")).unwrap();
        let err = resolve_loop(&store, "ab").unwrap_err();
        assert_eq!(user_facing_message(&err), "ambiguous loop");
        assert_eq!(exit_code(&Err(err)), 1);
    }

    #[test]
    fn bare_store_error_maps_to_internal_exit_code() {
        // Unlike the CLI's own `resolve_loop` (which wraps a missing loop in
        // `ForgeError::NotFound` for exit code 1), a raw `StoreError` bubbling
        // up unwrapped is treated as internal: it means a code path forgot to
        // translate it into a user-facing error.
        let store = Store::open_in_memory().unwrap();
        let err = store.update_loop(&Loop::new("missing", "", "demo", "/repo")).unwrap_err();
        let err = ForgeError::from(err);
        assert_eq!(exit_code(&Err(err)), 2);
    }

    #[tokio::test]
    async fn enqueue_and_notify_with_no_daemon_still_enqueues() {
        let store = store_with_loop("demo", "ab12cd34");
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("forge.sock");
        enqueue_and_notify(&store, &socket_path, "demo", Intent::Pause).await.unwrap();
        let pending = store.pending_items("id-demo").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].intent, Intent::Pause);
    }

    #[test]
    fn cmd_loop_create_then_list_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        cmd_loop(
            &store,
            &config,
            LoopCommand::Create {
                name: "demo".to_string(),
                repo_path: "/repo".to_string(),
                prompt: Some("hello".to_string()),
                prompt_path: None,
                profile: None,
                pool: None,
                interval_seconds: Some(30),
            },
        )
        .unwrap();
        let loops = store.list_loops().unwrap();
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].interval_seconds, 30);
    }

    #[test]
    fn cmd_loop_create_with_no_interval_falls_back_to_config_default() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        cmd_loop(
            &store,
            &config,
            LoopCommand::Create {
                name: "demo".to_string(),
                repo_path: "/repo".to_string(),
                prompt: Some("hello".to_string()),
                prompt_path: None,
                profile: None,
                pool: None,
                interval_seconds: None,
            },
        )
        .unwrap();
        let loops = store.list_loops().unwrap();
        assert_eq!(loops[0].interval_seconds, config.poll_fallback_interval_secs);
    }

    #[test]
    fn cmd_pool_add_requires_existing_profile() {
        let store = Store::open_in_memory().unwrap();
        cmd_pool(&store, PoolCommand::Create { name: "main".to_string() }).unwrap();
        let err = cmd_pool(
            &store,
            PoolCommand::Add {
                pool: "main".to_string(),
                profile: "missing".to_string(),
                weight: 1,
            },
        )
        .unwrap_err();
        assert_eq!(exit_code(&Err(err)), 1);
    }
}
