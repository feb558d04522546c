//! Persistence for batch executions and their sub-tasks.
//!
//! Sub-task rows have a single writer (the worker that owns the task), so
//! they update with plain writes. Execution counters are recomputed by
//! whichever worker finishes last, so those go through a CAS on
//! `(execution_id, version)` and retry on contention.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::{debug, info};

use crate::error::{PlatformError, Result};
use crate::models::{
    BatchExecution, ExecutionStatus, SubTask, SubTaskStatus, TaskType, TriggerType,
};
use crate::store::MetaDb;

const CAS_MAX_ATTEMPTS: u32 = 16;

pub struct ExecutionStore {
    db: MetaDb,
}

impl ExecutionStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn create_execution(&self, exec: &BatchExecution, subtasks: &[SubTask]) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO execution (
                 execution_id, trigger_type, group_name, date_range, status,
                 started_at, completed_at, total_plugins, completed_plugins,
                 failed_plugins, cancelled_plugins, skipped_plugins,
                 error_summary, can_retry, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                exec.execution_id,
                exec.trigger_type.as_str(),
                exec.group_name,
                exec.date_range,
                exec.status.as_str(),
                exec.started_at.to_rfc3339(),
                exec.completed_at.map(|t| t.to_rfc3339()),
                exec.total_plugins,
                exec.completed_plugins,
                exec.failed_plugins,
                exec.cancelled_plugins,
                exec.skipped_plugins,
                exec.error_summary,
                exec.can_retry as i64,
                exec.version,
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO subtask (
                     task_id, execution_id, plugin_name, task_type, parameters_json,
                     status, progress, records_processed, records_failed,
                     started_at, completed_at, error_message
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for task in subtasks {
                stmt.execute(params![
                    task.task_id,
                    task.execution_id,
                    task.plugin_name,
                    task.task_type.as_str(),
                    task.parameters.to_string(),
                    task.status.as_str(),
                    task.progress,
                    task.records_processed,
                    task.records_failed,
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                    task.error_message,
                ])?;
            }
        }
        tx.commit()?;
        info!(
            execution = %exec.execution_id,
            subtasks = subtasks.len(),
            trigger = exec.trigger_type.as_str(),
            "execution created"
        );
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<Option<BatchExecution>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT execution_id, trigger_type, group_name, date_range, status,
                    started_at, completed_at, total_plugins, completed_plugins,
                    failed_plugins, cancelled_plugins, skipped_plugins,
                    error_summary, can_retry, version
             FROM execution WHERE execution_id = ?1",
        )?;
        let mut rows = stmt.query_map([execution_id], map_execution)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn require_execution(&self, execution_id: &str) -> Result<BatchExecution> {
        self.get_execution(execution_id)?
            .ok_or_else(|| PlatformError::NotFound(format!("execution '{execution_id}'")))
    }

    pub fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        trigger_type: Option<TriggerType>,
        limit: usize,
    ) -> Result<Vec<BatchExecution>> {
        let conn = self.db.conn();
        let mut sql = String::from(
            "SELECT execution_id, trigger_type, group_name, date_range, status,
                    started_at, completed_at, total_plugins, completed_plugins,
                    failed_plugins, cancelled_plugins, skipped_plugins,
                    error_summary, can_retry, version
             FROM execution WHERE 1 = 1",
        );
        let mut bound: Vec<String> = Vec::new();
        if let Some(s) = status {
            bound.push(s.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", bound.len()));
        }
        if let Some(t) = trigger_type {
            bound.push(t.as_str().to_string());
            sql.push_str(&format!(" AND trigger_type = ?{}", bound.len()));
        }
        sql.push_str(&format!(" ORDER BY started_at DESC LIMIT {limit}"));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bound), map_execution)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Optimistic read-modify-write on one execution row.
    pub fn cas_update_execution<F>(&self, execution_id: &str, mutate: F) -> Result<BatchExecution>
    where
        F: Fn(&mut BatchExecution),
    {
        for _ in 0..CAS_MAX_ATTEMPTS {
            let mut exec = self.require_execution(execution_id)?;
            let expected_version = exec.version;
            mutate(&mut exec);
            exec.version = expected_version + 1;

            let updated = self.db.conn().execute(
                "UPDATE execution SET
                     status = ?1, completed_at = ?2, total_plugins = ?3,
                     completed_plugins = ?4, failed_plugins = ?5,
                     cancelled_plugins = ?6, skipped_plugins = ?7,
                     error_summary = ?8, can_retry = ?9, version = ?10
                 WHERE execution_id = ?11 AND version = ?12",
                params![
                    exec.status.as_str(),
                    exec.completed_at.map(|t| t.to_rfc3339()),
                    exec.total_plugins,
                    exec.completed_plugins,
                    exec.failed_plugins,
                    exec.cancelled_plugins,
                    exec.skipped_plugins,
                    exec.error_summary,
                    exec.can_retry as i64,
                    exec.version,
                    execution_id,
                    expected_version,
                ],
            )?;
            if updated == 1 {
                return Ok(exec);
            }
            debug!(execution = execution_id, "execution CAS contention, retrying");
        }
        Err(PlatformError::Store(format!(
            "execution '{execution_id}' CAS exhausted after {CAS_MAX_ATTEMPTS} attempts"
        )))
    }

    /// Recount counters from children and fold them into the row.
    pub fn recompute_counters(&self, execution_id: &str) -> Result<BatchExecution> {
        let (completed, failed, cancelled, skipped) = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare_cached(
                "SELECT status, COUNT(*) FROM subtask WHERE execution_id = ?1 GROUP BY status",
            )?;
            let rows = stmt.query_map([execution_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
            })?;
            let mut counts = (0u32, 0u32, 0u32, 0u32);
            for row in rows {
                let (status, n) = row?;
                match SubTaskStatus::parse(&status) {
                    Some(SubTaskStatus::Completed) => counts.0 = n,
                    Some(SubTaskStatus::Failed) => counts.1 = n,
                    Some(SubTaskStatus::Cancelled) => counts.2 = n,
                    Some(SubTaskStatus::Skipped) => counts.3 = n,
                    _ => {}
                }
            }
            counts
        };

        self.cas_update_execution(execution_id, |exec| {
            exec.completed_plugins = completed;
            exec.failed_plugins = failed;
            exec.cancelled_plugins = cancelled;
            exec.skipped_plugins = skipped;
        })
    }

    pub fn get_subtasks(&self, execution_id: &str) -> Result<Vec<SubTask>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT task_id, execution_id, plugin_name, task_type, parameters_json,
                    status, progress, records_processed, records_failed,
                    started_at, completed_at, error_message
             FROM subtask WHERE execution_id = ?1 ORDER BY task_id",
        )?;
        let rows = stmt.query_map([execution_id], map_subtask)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn update_subtask(&self, task: &SubTask) -> Result<()> {
        self.db.conn().execute(
            "UPDATE subtask SET
                 status = ?1, progress = ?2, records_processed = ?3,
                 records_failed = ?4, started_at = ?5, completed_at = ?6,
                 error_message = ?7
             WHERE task_id = ?8",
            params![
                task.status.as_str(),
                task.progress,
                task.records_processed,
                task.records_failed,
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.error_message,
                task.task_id,
            ],
        )?;
        Ok(())
    }

    /// Reset every failed/cancelled sub-task for an in-place retry.
    /// Returns the reset tasks; already-completed siblings are untouched.
    pub fn reset_retryable_subtasks(&self, execution_id: &str) -> Result<Vec<SubTask>> {
        self.db.conn().execute(
            "UPDATE subtask SET
                 status = 'pending', progress = 0, records_processed = 0,
                 records_failed = 0, started_at = NULL, completed_at = NULL,
                 error_message = NULL
             WHERE execution_id = ?1 AND status IN ('failed', 'cancelled')",
            [execution_id],
        )?;
        Ok(self
            .get_subtasks(execution_id)?
            .into_iter()
            .filter(|t| t.status == SubTaskStatus::Pending)
            .collect())
    }

    /// Startup recovery: anything left non-terminal by a previous process
    /// becomes `interrupted` (its open sub-tasks `cancelled`).
    pub fn mark_interrupted(&self, now: DateTime<Utc>) -> Result<u32> {
        let open: Vec<String> = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT execution_id FROM execution
                 WHERE status IN ('pending', 'running', 'stopping')",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for execution_id in &open {
            self.db.conn().execute(
                "UPDATE subtask SET status = 'cancelled', completed_at = ?1,
                        error_message = COALESCE(error_message, 'interrupted by restart')
                 WHERE execution_id = ?2 AND status IN ('pending', 'running')",
                params![now.to_rfc3339(), execution_id],
            )?;
            let recomputed = self.recompute_counters(execution_id)?;
            self.cas_update_execution(execution_id, |exec| {
                exec.status = ExecutionStatus::Interrupted;
                exec.completed_at = Some(now);
                exec.can_retry =
                    recomputed.failed_plugins > 0 || recomputed.cancelled_plugins > 0;
            })?;
        }
        Ok(open.len() as u32)
    }

    /// Retention sweep: drop terminal executions older than the cutoff.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u32> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let cutoff = cutoff.to_rfc3339();
        tx.execute(
            "DELETE FROM subtask WHERE execution_id IN (
                 SELECT execution_id FROM execution
                 WHERE completed_at IS NOT NULL AND completed_at < ?1
             )",
            [&cutoff],
        )?;
        let pruned = tx.execute(
            "DELETE FROM execution WHERE completed_at IS NOT NULL AND completed_at < ?1",
            [&cutoff],
        )?;
        tx.commit()?;
        if pruned > 0 {
            info!(pruned, "execution history pruned");
        }
        Ok(pruned as u32)
    }

    /// Hard delete of one execution; the API layer forbids this while the
    /// execution is still running.
    pub fn delete_execution(&self, execution_id: &str) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM subtask WHERE execution_id = ?1", [execution_id])?;
        let n = tx.execute("DELETE FROM execution WHERE execution_id = ?1", [execution_id])?;
        tx.commit()?;
        if n == 0 {
            return Err(PlatformError::NotFound(format!(
                "execution '{execution_id}'"
            )));
        }
        Ok(())
    }
}

fn map_execution(row: &Row<'_>) -> rusqlite::Result<BatchExecution> {
    let trigger: String = row.get(1)?;
    let status: String = row.get(4)?;
    let started_at: String = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    Ok(BatchExecution {
        execution_id: row.get(0)?,
        trigger_type: TriggerType::parse(&trigger).unwrap_or(TriggerType::Manual),
        group_name: row.get(2)?,
        date_range: row.get(3)?,
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
        started_at: parse_ts(&started_at),
        completed_at: completed_at.as_deref().map(parse_ts),
        total_plugins: row.get(7)?,
        completed_plugins: row.get(8)?,
        failed_plugins: row.get(9)?,
        cancelled_plugins: row.get(10)?,
        skipped_plugins: row.get(11)?,
        error_summary: row.get(12)?,
        can_retry: row.get::<_, i64>(13)? != 0,
        version: row.get(14)?,
    })
}

fn map_subtask(row: &Row<'_>) -> rusqlite::Result<SubTask> {
    let task_type: String = row.get(3)?;
    let parameters: String = row.get(4)?;
    let status: String = row.get(5)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    Ok(SubTask {
        task_id: row.get(0)?,
        execution_id: row.get(1)?,
        plugin_name: row.get(2)?,
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::Incremental),
        parameters: serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null),
        status: SubTaskStatus::parse(&status).unwrap_or(SubTaskStatus::Failed),
        progress: row.get(6)?,
        records_processed: row.get(7)?,
        records_failed: row.get(8)?,
        started_at: started_at.as_deref().map(parse_ts),
        completed_at: completed_at.as_deref().map(parse_ts),
        error_message: row.get(11)?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ExecutionStore {
        ExecutionStore::new(MetaDb::open_in_memory().unwrap())
    }

    fn execution(id: &str, total: u32) -> BatchExecution {
        BatchExecution {
            execution_id: id.to_string(),
            trigger_type: TriggerType::Manual,
            group_name: None,
            date_range: None,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_plugins: total,
            completed_plugins: 0,
            failed_plugins: 0,
            cancelled_plugins: 0,
            skipped_plugins: 0,
            error_summary: None,
            can_retry: false,
            version: 0,
        }
    }

    fn subtask(id: &str, exec: &str, status: SubTaskStatus) -> SubTask {
        SubTask {
            task_id: id.to_string(),
            execution_id: exec.to_string(),
            plugin_name: "daily_bar".to_string(),
            task_type: TaskType::Backfill,
            parameters: json!({"trade_date": "20260109"}),
            status,
            progress: 0,
            records_processed: 0,
            records_failed: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn roundtrip_and_counter_recompute() {
        let store = store();
        let exec = execution("e1", 3);
        let tasks = vec![
            subtask("t1", "e1", SubTaskStatus::Completed),
            subtask("t2", "e1", SubTaskStatus::Failed),
            subtask("t3", "e1", SubTaskStatus::Skipped),
        ];
        store.create_execution(&exec, &tasks).unwrap();

        let recomputed = store.recompute_counters("e1").unwrap();
        assert_eq!(recomputed.completed_plugins, 1);
        assert_eq!(recomputed.failed_plugins, 1);
        assert_eq!(recomputed.skipped_plugins, 1);
        assert!(recomputed.counters_consistent());
    }

    #[test]
    fn cas_bumps_version() {
        let store = store();
        store.create_execution(&execution("e1", 0), &[]).unwrap();

        let a = store
            .cas_update_execution("e1", |e| e.status = ExecutionStatus::Running)
            .unwrap();
        let b = store
            .cas_update_execution("e1", |e| e.status = ExecutionStatus::Completed)
            .unwrap();
        assert_eq!(a.version + 1, b.version);
        assert_eq!(
            store.require_execution("e1").unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[test]
    fn reset_retryable_clears_error_state() {
        let store = store();
        let mut failed = subtask("t1", "e1", SubTaskStatus::Failed);
        failed.progress = 40;
        failed.records_processed = 10;
        failed.error_message = Some("provider exploded".to_string());
        let done = subtask("t2", "e1", SubTaskStatus::Completed);
        store
            .create_execution(&execution("e1", 2), &[failed, done])
            .unwrap();

        let reset = store.reset_retryable_subtasks("e1").unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].task_id, "t1");
        assert_eq!(reset[0].progress, 0);
        assert_eq!(reset[0].records_processed, 0);
        assert!(reset[0].error_message.is_none());

        // The completed sibling is untouched.
        let all = store.get_subtasks("e1").unwrap();
        assert!(all
            .iter()
            .any(|t| t.task_id == "t2" && t.status == SubTaskStatus::Completed));
    }

    #[test]
    fn startup_recovery_marks_interrupted() {
        let store = store();
        let mut exec = execution("e1", 2);
        exec.status = ExecutionStatus::Running;
        store
            .create_execution(
                &exec,
                &[
                    subtask("t1", "e1", SubTaskStatus::Running),
                    subtask("t2", "e1", SubTaskStatus::Completed),
                ],
            )
            .unwrap();

        let n = store.mark_interrupted(Utc::now()).unwrap();
        assert_eq!(n, 1);

        let exec = store.require_execution("e1").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Interrupted);
        assert!(exec.can_retry);
        assert!(exec.counters_consistent());
    }

    #[test]
    fn prune_respects_cutoff() {
        let store = store();
        let mut old = execution("old", 0);
        old.completed_at = Some(Utc::now() - chrono::Duration::days(40));
        let mut fresh = execution("fresh", 0);
        fresh.completed_at = Some(Utc::now());
        store.create_execution(&old, &[]).unwrap();
        store.create_execution(&fresh, &[]).unwrap();

        let pruned = store
            .prune_older_than(Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_execution("old").unwrap().is_none());
        assert!(store.get_execution("fresh").unwrap().is_some());
    }
}
