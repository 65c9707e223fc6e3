//! Task definitions for the scheduler.
//!
//! This module defines the core types shared by the store, the scanner and
//! the workers:
//!
//! - `Task`: A row of the durable `tasks` table
//! - `TaskStatus`: Lifecycle state of a task
//! - `TaskResult`: Outcome reported by a handler
//! - `ClaimedTask` / `ClaimOutcome`: Result of one claim attempt
//! - `Transition`: What a worker's final write changed

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::TaskError;

/// Error recorded on every task failed by a cancellation.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Identifier of a task, assigned by the database on insert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Identity of a worker, recorded on the rows it leases.
///
/// Every worker in every process gets a fresh UUID v4 at startup, so two
/// workers never share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generates a new, unique worker id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// pending -> running -> completed | failed | waiting | pending
/// waiting -> pending            (resume)
/// pending | running | waiting -> failed   (cancel)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Ready to be claimed.
    Pending,
    /// Leased by a worker.
    Running,
    /// Parked until something resumes it.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; `error` says why.
    Failed,
}

impl TaskStatus {
    /// Returns the value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "waiting" => Ok(TaskStatus::Waiting),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// A task as stored in the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    /// Opaque handler state, passed through untouched.
    pub state: Value,
    pub status: TaskStatus,
    /// Set only while the task is running.
    pub worker_id: Option<WorkerId>,
    /// Set only while the task is running.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Set only once the task has failed.
    pub error: Option<String>,
    pub parent_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Maps a row selected with every column of `tasks`.
    pub(crate) fn from_row(row: &PgRow) -> Result<Self, TaskError> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            state: row.try_get("state")?,
            status: status.parse()?,
            worker_id: row.try_get("worker_id")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            error: row.try_get("error")?,
            parent_id: row.try_get("parent_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of a handler run.
///
/// Use the constructors rather than building one by hand; `Running` is not a
/// valid outcome and is rejected when the result is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Replacement state. `None` leaves the stored state unchanged.
    pub new_state: Option<Value>,
    pub new_status: TaskStatus,
    /// Failure message, recorded verbatim when `new_status` is `Failed`.
    pub error: Option<String>,
}

impl TaskResult {
    /// Requeues the task so it runs again as soon as a worker is free.
    pub fn pending(new_state: Option<Value>) -> Self {
        Self {
            new_state,
            new_status: TaskStatus::Pending,
            error: None,
        }
    }

    /// Parks the task until it is resumed, typically by a finishing child.
    pub fn waiting(new_state: Option<Value>) -> Self {
        Self {
            new_state,
            new_status: TaskStatus::Waiting,
            error: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            new_state: None,
            new_status: TaskStatus::Completed,
            error: None,
        }
    }

    pub fn completed_with_state(state: Value) -> Self {
        Self {
            new_state: Some(state),
            new_status: TaskStatus::Completed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            new_state: None,
            new_status: TaskStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// A task leased to a worker by a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub task_type: String,
    pub state: Value,
    pub worker_id: WorkerId,
}

/// Result of a single claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// A row was leased to the requesting worker.
    Claimed(ClaimedTask),
    /// Nothing is eligible right now.
    Empty,
    /// The claim lost a serialization race; scan again straight away.
    Contended,
}

/// The change made by applying a handler's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Parent moved from `waiting` back to `pending`, if any.
    pub resumed_parent: Option<TaskId>,
}
