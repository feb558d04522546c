//! Sqlite-backed persistence.
//!
//! One database file carries both the platform metadata (executions,
//! sub-tasks, schema audit, arena aggregates) and the per-plugin ODS tables.
//! WAL mode keeps readers off the writers' backs; short critical sections
//! go through `parking_lot::Mutex`.

pub mod execution;
pub mod ods;
pub mod schema_sync;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::error::{PlatformError, Result};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS execution (
    execution_id TEXT PRIMARY KEY,
    trigger_type TEXT NOT NULL,
    group_name TEXT,
    date_range TEXT,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_plugins INTEGER NOT NULL DEFAULT 0,
    completed_plugins INTEGER NOT NULL DEFAULT 0,
    failed_plugins INTEGER NOT NULL DEFAULT 0,
    cancelled_plugins INTEGER NOT NULL DEFAULT 0,
    skipped_plugins INTEGER NOT NULL DEFAULT 0,
    error_summary TEXT,
    can_retry INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_execution_started
    ON execution(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_execution_status
    ON execution(status, started_at DESC);

CREATE TABLE IF NOT EXISTS subtask (
    task_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL,
    plugin_name TEXT NOT NULL,
    task_type TEXT NOT NULL,
    parameters_json TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_subtask_execution
    ON subtask(execution_id);

CREATE TABLE IF NOT EXISTS schema_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    action TEXT NOT NULL,
    old_type TEXT,
    new_type TEXT,
    at TEXT NOT NULL,
    reason TEXT
);

CREATE TABLE IF NOT EXISTS table_meta (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    decl_type TEXT NOT NULL,
    nullable INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (table_name, column_name)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS plugin_override (
    plugin_name TEXT PRIMARY KEY,
    schedule_enabled INTEGER NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS arena (
    arena_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    config_json TEXT NOT NULL,
    agents_json TEXT NOT NULL DEFAULT '[]',
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    round_counter INTEGER NOT NULL DEFAULT 0,
    evaluation_counter INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS strategy (
    strategy_id TEXT PRIMARY KEY,
    arena_id TEXT NOT NULL,
    name TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    agent_role TEXT NOT NULL,
    stage TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    current_score REAL NOT NULL DEFAULT 0,
    current_rank INTEGER NOT NULL DEFAULT 0,
    logic TEXT NOT NULL,
    rules_json TEXT NOT NULL,
    dimension_scores_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_strategy_arena ON strategy(arena_id);

CREATE TABLE IF NOT EXISTS discussion_round (
    round_id TEXT PRIMARY KEY,
    arena_id TEXT NOT NULL,
    round_number INTEGER NOT NULL,
    mode TEXT NOT NULL,
    participants_json TEXT NOT NULL,
    conclusions_json TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT
) WITHOUT ROWID;

-- Rowid kept: the append order is the stream order, and timestamps can
-- tie within one clock tick.
CREATE TABLE IF NOT EXISTS thinking_message (
    id TEXT NOT NULL UNIQUE,
    arena_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    agent_role TEXT NOT NULL,
    round_id TEXT,
    msg_type TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_thinking_arena
    ON thinking_message(arena_id, timestamp);

CREATE TABLE IF NOT EXISTS elimination_event (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    arena_id TEXT NOT NULL,
    period TEXT NOT NULL,
    strategy_id TEXT NOT NULL,
    score REAL NOT NULL,
    reason TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluation_summary (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    arena_id TEXT NOT NULL,
    period TEXT NOT NULL,
    evaluated INTEGER NOT NULL,
    eliminated INTEGER NOT NULL,
    top_strategy TEXT,
    timestamp TEXT NOT NULL
);
"#;

/// Shared handle over the platform database.
#[derive(Clone, Debug)]
pub struct MetaDb {
    conn: Arc<Mutex<Connection>>,
}

impl MetaDb {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Scratch database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| PlatformError::Store(format!("schema bootstrap: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let db = MetaDb::open_in_memory().unwrap();
        db.conn().execute_batch(SCHEMA_SQL).unwrap();
        let n: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM execution", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let path = path.to_str().unwrap();

        {
            let db = MetaDb::open(path).unwrap();
            db.conn()
                .execute(
                    "INSERT INTO plugin_override (plugin_name, schedule_enabled, updated_at)
                     VALUES ('daily_bar', 0, '2026-01-09T00:00:00Z')",
                    [],
                )
                .unwrap();
        }

        let db = MetaDb::open(path).unwrap();
        let enabled: i64 = db
            .conn()
            .query_row(
                "SELECT schedule_enabled FROM plugin_override WHERE plugin_name = 'daily_bar'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(enabled, 0);
    }
}
