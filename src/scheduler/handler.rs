//! Handler contract and execution context.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::storage::{tasks, Channel};

use super::task::{Task, TaskId, TaskResult, WorkerId};

/// Code that executes tasks of one type.
///
/// Delivery is at-least-once: a task whose worker crashes or loses its lease
/// runs again elsewhere, so handlers must be idempotent or check for work
/// already done.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one attempt of a task and reports its outcome.
    ///
    /// `state` is the task's stored state. Writes made through
    /// `ctx.conn()` commit together with the returned outcome, or not at all.
    async fn handle(&self, ctx: &mut TaskContext<'_>, state: Value) -> TaskResult;
}

/// What a handler can see and use while it runs.
///
/// The context borrows the worker's execution transaction. Database writes
/// made through it become visible only if the whole run commits. Side
/// effects outside the database cannot be rolled back: perform them last,
/// and make them safe to repeat, because a failed commit means the task
/// will run again.
pub struct TaskContext<'a> {
    conn: &'a mut PgConnection,
    channel: &'a Channel,
    task_id: TaskId,
    task_type: &'a str,
    worker_id: &'a WorkerId,
    shutdown: CancellationToken,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        conn: &'a mut PgConnection,
        channel: &'a Channel,
        task_id: TaskId,
        task_type: &'a str,
        worker_id: &'a WorkerId,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            conn,
            channel,
            task_id,
            task_type,
            worker_id,
            shutdown,
        }
    }

    /// The execution transaction.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &str {
        self.task_type
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.worker_id
    }

    /// Channel that writes made through this context publish on.
    pub fn channel(&self) -> &Channel {
        self.channel
    }

    /// Token cancelled when the scheduler shuts down.
    ///
    /// Handlers are never aborted; long-running ones should watch this and
    /// return early, typically with `TaskResult::pending` to be picked up
    /// again after restart.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Creates a child of the running task inside its transaction.
    pub async fn create_child(
        &mut self,
        task_type: &str,
        state: Option<Value>,
    ) -> Result<TaskId, TaskError> {
        tasks::create_child(&mut *self.conn, self.channel, self.task_id, task_type, state).await
    }

    /// Creates an unrelated task inside the running task's transaction.
    pub async fn create(&mut self, task_type: &str, state: Option<Value>) -> Result<TaskId, TaskError> {
        tasks::create(&mut *self.conn, self.channel, task_type, state).await
    }

    /// Lists the running task's children, oldest first.
    pub async fn child_tasks(&mut self) -> Result<Vec<Task>, TaskError> {
        tasks::get_child_tasks(&mut *self.conn, self.task_id).await
    }

    /// Lists and row-locks the running task's children.
    ///
    /// Use this before returning `TaskResult::waiting` based on the
    /// children's states, so a child finishing at the same moment cannot
    /// miss resuming this task.
    pub async fn lock_child_tasks(&mut self) -> Result<Vec<Task>, TaskError> {
        tasks::lock_child_tasks(&mut *self.conn, self.task_id).await
    }

    /// Resumes another waiting task inside this transaction.
    pub async fn resume(&mut self, id: TaskId) -> Result<bool, TaskError> {
        tasks::resume(&mut *self.conn, self.channel, id).await
    }
}
