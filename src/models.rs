//! Shared domain models for the ingestion core.
//!
//! Everything the scheduler, execution store and API agree on lives here:
//! trigger/task kinds, execution and sub-task rows, and trade-date helpers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How a batch execution came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Group,
    Retry,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
            TriggerType::Group => "group",
            TriggerType::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            "group" => Some(TriggerType::Group),
            "retry" => Some(TriggerType::Retry),
            _ => None,
        }
    }
}

/// What a sub-task is asked to do with its plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Latest trading day only.
    Incremental,
    /// Whole declared history, dates fanned out inside one sub-task.
    Full,
    /// Explicit list of trade dates, one sub-task per date.
    Backfill,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Incremental => "incremental",
            TaskType::Full => "full",
            TaskType::Backfill => "backfill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incremental" => Some(TaskType::Incremental),
            "full" => Some(TaskType::Full),
            "backfill" => Some(TaskType::Backfill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopping,
    Stopped,
    Skipped,
    /// Left non-terminal by a crash; recovered at startup.
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Stopping => "stopping",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "stopping" => Some(ExecutionStatus::Stopping),
            "stopped" => Some(ExecutionStatus::Stopped),
            "skipped" => Some(ExecutionStatus::Skipped),
            "interrupted" => Some(ExecutionStatus::Interrupted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Stopped
                | ExecutionStatus::Skipped
                | ExecutionStatus::Interrupted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::Running => "running",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Failed => "failed",
            SubTaskStatus::Cancelled => "cancelled",
            SubTaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubTaskStatus::Pending),
            "running" => Some(SubTaskStatus::Running),
            "completed" => Some(SubTaskStatus::Completed),
            "failed" => Some(SubTaskStatus::Failed),
            "cancelled" => Some(SubTaskStatus::Cancelled),
            "skipped" => Some(SubTaskStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubTaskStatus::Pending | SubTaskStatus::Running)
    }

    /// Statuses that make a sub-task eligible for in-place retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubTaskStatus::Failed | SubTaskStatus::Cancelled)
    }
}

/// One top-level scheduled or user-triggered unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchExecution {
    pub execution_id: String,
    pub trigger_type: TriggerType,
    pub group_name: Option<String>,
    pub date_range: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_plugins: u32,
    pub completed_plugins: u32,
    pub failed_plugins: u32,
    pub cancelled_plugins: u32,
    pub skipped_plugins: u32,
    pub error_summary: Option<String>,
    pub can_retry: bool,
    /// CAS guard for counter updates; bumped on every row write.
    #[serde(skip_serializing, default)]
    pub version: i64,
}

impl BatchExecution {
    /// Terminal-state accounting invariant.
    pub fn counters_consistent(&self) -> bool {
        self.total_plugins
            == self.completed_plugins
                + self.failed_plugins
                + self.cancelled_plugins
                + self.skipped_plugins
    }
}

/// A single (plugin x parameters) unit inside a batch execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub task_id: String,
    pub execution_id: String,
    pub plugin_name: String,
    pub task_type: TaskType,
    pub parameters: serde_json::Value,
    pub status: SubTaskStatus,
    pub progress: u8,
    pub records_processed: u64,
    pub records_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SubTask {
    /// The single trade date this sub-task targets, if it has one.
    pub fn trade_date(&self) -> Option<NaiveDate> {
        self.parameters
            .get("trade_date")
            .and_then(|v| v.as_str())
            .and_then(parse_trade_date)
    }

    /// Completed without error but nothing came back from the provider.
    pub fn is_no_data(&self) -> bool {
        self.status == SubTaskStatus::Completed && self.records_processed == 0
    }
}

/// Manual sync request body (`POST /api/datasource/sync`).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    pub plugin_name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub trade_dates: Option<Vec<String>>,
    #[serde(default)]
    pub force_overwrite: bool,
}

/// Group trigger request body (`POST /api/datasource/group/{id}/trigger`).
#[derive(Debug, Clone, Deserialize)]
pub struct GroupTriggerRequest {
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub trade_dates: Option<Vec<String>>,
    #[serde(default)]
    pub force_overwrite: bool,
}

/// Accepts both the provider's compact `YYYYMMDD` form and ISO `YYYY-MM-DD`.
pub fn parse_trade_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// Compact provider-wire form.
pub fn format_trade_date(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_date_both_forms() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 9).unwrap();
        assert_eq!(parse_trade_date("20260109"), Some(d));
        assert_eq!(parse_trade_date("2026-01-09"), Some(d));
        assert_eq!(parse_trade_date("not-a-date"), None);
        assert_eq!(format_trade_date(d), "20260109");
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(ExecutionStatus::Interrupted.is_terminal());
        assert!(!ExecutionStatus::Stopping.is_terminal());
        assert!(SubTaskStatus::Skipped.is_terminal());
        assert!(!SubTaskStatus::Running.is_terminal());
    }
}
