//! Durable persistence for loops, runs, queue items, pools, profiles, and
//! events, backed by a single embedded SQLite database opened in WAL mode.
//!
//! The schema is applied forward-only from the numbered statements in
//! [`MIGRATIONS`]; applied versions are tracked in `schema_version`.

mod events;
mod loops;
mod pools;
mod profiles;
mod queue;
mod runs;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, info};

pub use queue::ReorderError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database is locked, retry")]
    Locked,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid stored value for column {column}: {message}")]
    Decode { column: &'static str, message: String },
}

impl StoreError {
    fn from_sqlite(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                StoreError::AlreadyExists(err.to_string())
            }
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DatabaseBusy => StoreError::Locked,
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("row".to_string()),
            _ => StoreError::Sqlite(err),
        }
    }
}

/// `(version, statements)` applied in order. Each entry's SQL may contain
/// multiple `;`-separated statements, executed via `execute_batch`.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS loops (
            id TEXT PRIMARY KEY,
            short_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            repo_path TEXT NOT NULL,
            base_prompt_path TEXT,
            base_prompt_msg TEXT,
            pool_id TEXT,
            profile_id TEXT,
            interval_seconds INTEGER NOT NULL DEFAULT 60,
            state TEXT NOT NULL DEFAULT 'stopped',
            last_run_at TEXT,
            last_exit_code INTEGER,
            last_error TEXT,
            log_path TEXT,
            ledger_path TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            harness TEXT NOT NULL,
            auth_kind TEXT,
            auth_home TEXT,
            prompt_mode TEXT NOT NULL DEFAULT 'stdin',
            command_template TEXT NOT NULL,
            model TEXT,
            extra_args TEXT NOT NULL DEFAULT '[]',
            env TEXT NOT NULL DEFAULT '{}',
            max_concurrency INTEGER NOT NULL DEFAULT 1,
            cooldown_until TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pools (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            strategy TEXT NOT NULL DEFAULT 'round_robin',
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pool_members (
            pool_id TEXT NOT NULL,
            profile_id TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 1,
            position INTEGER NOT NULL,
            PRIMARY KEY (pool_id, profile_id)
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE IF NOT EXISTS loop_runs (
            id TEXT PRIMARY KEY,
            loop_id TEXT NOT NULL,
            profile_id TEXT,
            status TEXT NOT NULL,
            prompt_source TEXT NOT NULL,
            prompt_path TEXT,
            prompt_override INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            exit_code INTEGER,
            output_tail TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_loop_runs_loop_id ON loop_runs(loop_id);
        CREATE INDEX IF NOT EXISTS idx_loop_runs_profile_status ON loop_runs(profile_id, status);

        CREATE TABLE IF NOT EXISTS loop_queue_items (
            id TEXT PRIMARY KEY,
            loop_id TEXT NOT NULL,
            intent TEXT NOT NULL,
            position INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            dispatched_at TEXT,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_loop_position ON loop_queue_items(loop_id, position);
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        "#,
    ),
];

/// Cheap-to-clone handle to the shared connection. All writers serialize on
/// the mutex; SQLite's WAL mode still lets other processes read the file
/// concurrently.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the database at `path`, enable WAL mode, and
    /// apply any unapplied migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        debug!(?path, "Store::open: called");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Decode {
                column: "path",
                message: e.to_string(),
            })?;
        }
        let conn = Connection::open(path).map_err(StoreError::from_sqlite)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(StoreError::from_sqlite)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store, useful for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::from_sqlite)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);",
        )
        .map_err(StoreError::from_sqlite)?;

        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
            .map_err(StoreError::from_sqlite)?;

        for &(version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            debug!(version, "Store::migrate: applying migration");
            conn.execute_batch(sql).map_err(StoreError::from_sqlite)?;
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(StoreError::from_sqlite)?;
            info!(version, "Store::migrate: applied migration");
        }
        Ok(())
    }

    /// Run `f` inside a single SQL transaction, committing on `Ok` and rolling
    /// back on `Err`. Used for every compound write (selection + run-row
    /// creation, loop-update + event-append, queue reorder).
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().map_err(StoreError::from_sqlite)?;
        let result = f(&tx)?;
        tx.commit().map_err(StoreError::from_sqlite)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_applies_all_migrations() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().0);
    }

    #[test]
    fn migrating_twice_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0)).unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
