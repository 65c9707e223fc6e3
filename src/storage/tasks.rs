//! Task operations over a single connection.
//!
//! Every function here takes `&mut PgConnection`, so the same calls work on a
//! pooled connection, inside an ordinary transaction, or from a handler using
//! the transaction its worker opened (`TaskContext::conn`). Writes that make
//! work claimable publish on the notification channel; PostgreSQL delivers
//! the notification when the surrounding transaction commits.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info};

use crate::error::TaskError;
use crate::scheduler::{Task, TaskId, TaskResult, TaskStatus, Transition, WorkerId, CANCELLED_ERROR};

use super::channel::Channel;

// =============================================================================
// Notifications
// =============================================================================

/// Publishes an empty notification on `channel`.
pub async fn notify(conn: &mut PgConnection, channel: &Channel) -> Result<(), TaskError> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(channel.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

// =============================================================================
// Creation
// =============================================================================

/// Inserts a pending task and notifies schedulers.
///
/// A missing state is stored as `{}`.
pub async fn create(
    conn: &mut PgConnection,
    channel: &Channel,
    task_type: &str,
    state: Option<Value>,
) -> Result<TaskId, TaskError> {
    insert(conn, channel, task_type, state, None).await
}

/// Inserts a pending child of `parent_id` and notifies schedulers.
pub async fn create_child(
    conn: &mut PgConnection,
    channel: &Channel,
    parent_id: TaskId,
    task_type: &str,
    state: Option<Value>,
) -> Result<TaskId, TaskError> {
    insert(conn, channel, task_type, state, Some(parent_id)).await
}

async fn insert(
    conn: &mut PgConnection,
    channel: &Channel,
    task_type: &str,
    state: Option<Value>,
    parent_id: Option<TaskId>,
) -> Result<TaskId, TaskError> {
    let state = state.unwrap_or_else(|| Value::Object(Default::default()));

    let id: TaskId = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (task_type, state, parent_id)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(task_type)
    .bind(&state)
    .bind(parent_id)
    .fetch_one(&mut *conn)
    .await?;

    notify(conn, channel).await?;
    debug!(task_id = %id, task_type = %task_type, parent_id = ?parent_id, "Created task");

    Ok(id)
}

// =============================================================================
// Resumption
// =============================================================================

/// Moves a waiting task back to pending.
///
/// Returns false, without error, when the task is not waiting.
pub async fn resume(
    conn: &mut PgConnection,
    channel: &Channel,
    id: TaskId,
) -> Result<bool, TaskError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'pending', updated_at = NOW()
        WHERE id = $1 AND status = 'waiting'
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    let resumed = result.rows_affected() > 0;
    if resumed {
        notify(conn, channel).await?;
    }
    Ok(resumed)
}

/// Moves a waiting task back to pending and replaces its state.
pub async fn resume_with_state(
    conn: &mut PgConnection,
    channel: &Channel,
    id: TaskId,
    state: Value,
) -> Result<bool, TaskError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'pending', state = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'waiting'
        "#,
    )
    .bind(id)
    .bind(&state)
    .execute(&mut *conn)
    .await?;

    let resumed = result.rows_affected() > 0;
    if resumed {
        notify(conn, channel).await?;
    }
    Ok(resumed)
}

/// Resumes the parent of `child_id` if the parent is waiting.
async fn resume_parent_of(
    conn: &mut PgConnection,
    channel: &Channel,
    child_id: TaskId,
) -> Result<Option<TaskId>, TaskError> {
    let parent: Option<TaskId> = sqlx::query_scalar(
        r#"
        UPDATE tasks
        SET status = 'pending', updated_at = NOW()
        WHERE id = (SELECT parent_id FROM tasks WHERE id = $1)
          AND status = 'waiting'
        RETURNING id
        "#,
    )
    .bind(child_id)
    .fetch_optional(&mut *conn)
    .await?;

    if parent.is_some() {
        notify(conn, channel).await?;
    }
    Ok(parent)
}

// =============================================================================
// Queries
// =============================================================================

/// Fetches one task.
pub async fn get(conn: &mut PgConnection, id: TaskId) -> Result<Task, TaskError> {
    let row = sqlx::query(
        r#"
        SELECT id, task_type, state, status, worker_id, lease_expires_at,
               error, parent_id, created_at, updated_at
        FROM tasks
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    match row {
        Some(row) => Task::from_row(&row),
        None => Err(TaskError::NotFound(id)),
    }
}

/// Returns the direct children of `parent_id`, oldest first.
pub async fn get_child_tasks(
    conn: &mut PgConnection,
    parent_id: TaskId,
) -> Result<Vec<Task>, TaskError> {
    let rows = sqlx::query(
        r#"
        SELECT id, task_type, state, status, worker_id, lease_expires_at,
               error, parent_id, created_at, updated_at
        FROM tasks
        WHERE parent_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(parent_id)
    .fetch_all(conn)
    .await?;

    rows.iter().map(Task::from_row).collect()
}

/// Like `get_child_tasks`, but row-locks the children until the surrounding
/// transaction ends.
///
/// A parent deciding whether to keep waiting should read its children this
/// way. A child finishing concurrently either commits first and is seen here
/// as terminal, or blocks until the parent has committed `waiting` and then
/// resumes it.
pub async fn lock_child_tasks(
    conn: &mut PgConnection,
    parent_id: TaskId,
) -> Result<Vec<Task>, TaskError> {
    let rows = sqlx::query(
        r#"
        SELECT id, task_type, state, status, worker_id, lease_expires_at,
               error, parent_id, created_at, updated_at
        FROM tasks
        WHERE parent_id = $1
        ORDER BY created_at, id
        FOR UPDATE
        "#,
    )
    .bind(parent_id)
    .fetch_all(conn)
    .await?;

    rows.iter().map(Task::from_row).collect()
}

// =============================================================================
// Cancellation
// =============================================================================

/// Fails `id` and every non-terminal descendant with `CANCELLED_ERROR`.
///
/// Children are failed before their parents. Tasks already completed or
/// failed are left untouched. If `id` itself was failed here and its parent
/// is waiting, the parent is resumed like for any other failed child. Runs
/// in its own transaction (a savepoint when `conn` is already inside one)
/// and returns how many tasks were cancelled.
pub async fn cancel(
    conn: &mut PgConnection,
    channel: &Channel,
    id: TaskId,
) -> Result<u64, TaskError> {
    let mut tx = conn.begin().await?;

    let edges: Vec<(TaskId, Option<TaskId>)> = sqlx::query_as(
        r#"
        WITH RECURSIVE subtree AS (
            SELECT id, parent_id FROM tasks WHERE id = $1
            UNION ALL
            SELECT t.id, t.parent_id
            FROM tasks t
            JOIN subtree s ON t.parent_id = s.id
        )
        SELECT id, parent_id FROM subtree
        "#,
    )
    .bind(id)
    .fetch_all(&mut *tx)
    .await?;

    if edges.is_empty() {
        return Err(TaskError::NotFound(id));
    }

    let mut cancelled = 0;
    let mut root_cancelled = false;
    for task_id in cancellation_order(id, &edges) {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', error = $2, worker_id = NULL,
                lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(task_id)
        .bind(CANCELLED_ERROR)
        .execute(&mut *tx)
        .await?;
        cancelled += result.rows_affected();
        root_cancelled |= task_id == id && result.rows_affected() > 0;
    }

    let mut resumed_parent = None;
    if root_cancelled && external_parent(id, &edges).is_some() {
        resumed_parent = resume_parent_of(&mut tx, channel, id).await?;
    }

    tx.commit().await?;
    info!(
        task_id = %id,
        cancelled = cancelled,
        resumed_parent = ?resumed_parent.map(|p| p.get()),
        "Cancelled task tree"
    );

    Ok(cancelled)
}

/// Parent of `root` when it lies outside the subtree described by `edges`.
fn external_parent(root: TaskId, edges: &[(TaskId, Option<TaskId>)]) -> Option<TaskId> {
    let parent = edges
        .iter()
        .find(|(id, _)| *id == root)
        .and_then(|(_, parent)| *parent)?;
    if edges.iter().any(|(id, _)| *id == parent) {
        return None;
    }
    Some(parent)
}

/// Orders the subtree rooted at `root` children-first (depth-first
/// post-order), siblings by ascending id.
///
/// `edges` holds `(id, parent_id)` pairs for every task in the subtree.
/// Uses an explicit stack so arbitrarily deep trees cannot overflow.
pub fn cancellation_order(root: TaskId, edges: &[(TaskId, Option<TaskId>)]) -> Vec<TaskId> {
    let mut children: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for &(id, parent) in edges {
        if let Some(parent) = parent {
            if id != root {
                children.entry(parent).or_default().push(id);
            }
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_unstable();
    }

    let mut order = Vec::with_capacity(edges.len());
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        stack.push((id, true));
        if let Some(kids) = children.get(&id) {
            // Reversed so the lowest id is visited first.
            stack.extend(kids.iter().rev().map(|&kid| (kid, false)));
        }
    }
    order
}

// =============================================================================
// Execution results
// =============================================================================

/// Writes a handler's outcome for a task leased by `worker_id`.
///
/// The write only applies while the task is still running under this
/// worker's lease; otherwise `TaskError::LeaseLost` is returned and the
/// caller must roll back. A terminal outcome also resumes a waiting parent,
/// and an outcome that makes work claimable publishes a notification.
pub async fn apply_result(
    conn: &mut PgConnection,
    channel: &Channel,
    task_id: TaskId,
    worker_id: &WorkerId,
    result: &TaskResult,
) -> Result<Transition, TaskError> {
    let status = result.new_status;
    let error = match status {
        TaskStatus::Running => return Err(TaskError::InvalidOutcome(status)),
        TaskStatus::Failed => Some(result.error.clone().unwrap_or_default()),
        TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::Completed => None,
    };

    let updated = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $3,
            state = COALESCE($4, state),
            error = $5,
            worker_id = NULL,
            lease_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1 AND worker_id = $2 AND status = 'running'
        "#,
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(status.as_str())
    .bind(&result.new_state)
    .bind(error)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(TaskError::LeaseLost {
            task_id,
            worker_id: worker_id.clone(),
        });
    }

    let resumed_parent = if status.is_terminal() {
        resume_parent_of(conn, channel, task_id).await?
    } else {
        if status == TaskStatus::Pending {
            notify(conn, channel).await?;
        }
        None
    };

    Ok(Transition {
        task_id,
        status,
        resumed_parent,
    })
}
