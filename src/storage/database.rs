//! Pool-level task store.
//!
//! `TaskStore` wraps the connection pool and the notification channel. It
//! mirrors the connection-level API in `tasks` (each call in its own
//! transaction) and adds the scheduler-side operations: claiming, lease
//! renewal and opening execution transactions.

use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::error::TaskError;
use crate::scheduler::{
    ClaimOutcome, ClaimedTask, Task, TaskId, TaskResult, Transition, WorkerId,
};

use super::channel::Channel;
use super::config::StorageConfig;
use super::migrations::{MigrationError, MigrationRunner};
use super::tasks;

/// SQLSTATE reported when a REPEATABLE READ transaction loses a race.
const SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL-backed task store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: PgPool,
    channel: Channel,
}

impl TaskStore {
    /// Creates a store over an existing pool, publishing on the default channel.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: Channel::default(),
        }
    }

    /// Connects using `config` and returns a new store.
    pub async fn connect(config: &StorageConfig) -> Result<Self, TaskError> {
        Ok(Self::new(config.connect().await?))
    }

    /// Publishes on `channel` instead of the default.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Runs database migrations, returning how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await
    }

    // =========================================================================
    // Task API
    // =========================================================================

    pub async fn create(&self, task_type: &str, state: Option<Value>) -> Result<TaskId, TaskError> {
        let mut tx = self.pool.begin().await?;
        let id = tasks::create(&mut tx, &self.channel, task_type, state).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn create_child(
        &self,
        parent_id: TaskId,
        task_type: &str,
        state: Option<Value>,
    ) -> Result<TaskId, TaskError> {
        let mut tx = self.pool.begin().await?;
        let id = tasks::create_child(&mut tx, &self.channel, parent_id, task_type, state).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn resume(&self, id: TaskId) -> Result<bool, TaskError> {
        let mut tx = self.pool.begin().await?;
        let resumed = tasks::resume(&mut tx, &self.channel, id).await?;
        tx.commit().await?;
        Ok(resumed)
    }

    pub async fn resume_with_state(&self, id: TaskId, state: Value) -> Result<bool, TaskError> {
        let mut tx = self.pool.begin().await?;
        let resumed = tasks::resume_with_state(&mut tx, &self.channel, id, state).await?;
        tx.commit().await?;
        Ok(resumed)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        let mut conn = self.pool.acquire().await?;
        tasks::get(&mut conn, id).await
    }

    pub async fn get_child_tasks(&self, parent_id: TaskId) -> Result<Vec<Task>, TaskError> {
        let mut conn = self.pool.acquire().await?;
        tasks::get_child_tasks(&mut conn, parent_id).await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<u64, TaskError> {
        let mut conn = self.pool.acquire().await?;
        tasks::cancel(&mut conn, &self.channel, id).await
    }

    // =========================================================================
    // Scheduler Operations
    // =========================================================================

    /// Leases the oldest eligible task of one of `task_types` to `worker_id`.
    ///
    /// Eligible means pending, or running with an expired lease. The claim
    /// runs at REPEATABLE READ and commits before returning; losing a
    /// serialization race yields `ClaimOutcome::Contended`.
    pub async fn claim(
        &self,
        task_types: &[String],
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError> {
        if task_types.is_empty() {
            return Ok(ClaimOutcome::Empty);
        }

        match self.try_claim(task_types, worker_id, lease).await {
            Err(TaskError::Database(e)) if is_serialization_failure(&e) => {
                debug!(worker_id = %worker_id, "Claim lost a serialization race");
                Ok(ClaimOutcome::Contended)
            }
            other => other,
        }
    }

    async fn try_claim(
        &self,
        task_types: &[String],
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running',
                worker_id = $1,
                lease_expires_at = NOW() + ($2::bigint * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE (status = 'pending'
                       OR (status = 'running' AND lease_expires_at < NOW()))
                  AND task_type = ANY($3)
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, task_type, state
            "#,
        )
        .bind(worker_id)
        .bind(lease_millis(lease))
        .bind(task_types)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(ClaimOutcome::Empty);
        };

        let claimed = claimed_from_row(&row, worker_id)?;
        tx.commit().await?;

        Ok(ClaimOutcome::Claimed(claimed))
    }

    /// Extends the lease on a task still running under `worker_id`.
    ///
    /// Returns false when the lease is no longer held.
    pub async fn renew_lease(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<bool, TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET lease_expires_at = NOW() + ($3::bigint * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_millis(lease))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Opens the READ COMMITTED transaction a handler runs in.
    pub async fn begin_execution(&self) -> Result<Transaction<'static, Postgres>, TaskError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Applies `result` to a claimed task in a transaction of its own.
    pub async fn finish(
        &self,
        task: &ClaimedTask,
        result: &TaskResult,
    ) -> Result<Transition, TaskError> {
        let mut tx = self.begin_execution().await?;
        let transition =
            tasks::apply_result(&mut tx, &self.channel, task.id, &task.worker_id, result).await?;
        tx.commit().await?;
        Ok(transition)
    }
}

fn claimed_from_row(row: &PgRow, worker_id: &WorkerId) -> Result<ClaimedTask, TaskError> {
    Ok(ClaimedTask {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        state: row.try_get("state")?,
        worker_id: worker_id.clone(),
    })
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == SERIALIZATION_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_millis() {
        assert_eq!(lease_millis(Duration::from_secs(300)), 300_000);
        assert_eq!(lease_millis(Duration::from_millis(1)), 1);
        assert_eq!(lease_millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_non_database_errors_are_not_serialization_failures() {
        assert!(!is_serialization_failure(&sqlx::Error::PoolTimedOut));
        assert!(!is_serialization_failure(&sqlx::Error::RowNotFound));
    }
}
