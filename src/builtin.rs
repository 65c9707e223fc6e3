//! Built-in handlers run by `leasehold work`.
//!
//! - `echo`: completes immediately, keeping its state
//! - `fan_out`: spawns one `echo` child per entry of `children`, waits for
//!   all of them, then completes with their final states

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::RegistryError;
use crate::scheduler::{Registry, Task, TaskContext, TaskHandler, TaskResult, TaskStatus};

/// Registers every built-in handler.
pub fn register_all(registry: &Registry) -> Result<(), RegistryError> {
    registry.register(EchoHandler::TASK_TYPE, EchoHandler)?;
    registry.register(FanOutHandler::TASK_TYPE, FanOutHandler)?;
    Ok(())
}

/// Logs its state and completes.
pub struct EchoHandler;

impl EchoHandler {
    pub const TASK_TYPE: &'static str = "echo";
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, ctx: &mut TaskContext<'_>, state: Value) -> TaskResult {
        info!(task_id = %ctx.task_id(), state = %state, "echo");
        TaskResult::completed_with_state(state)
    }
}

/// State of a `fan_out` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutState {
    /// Initial state of each child.
    #[serde(default)]
    pub children: Vec<Value>,
    /// Set once the children have been created.
    #[serde(default)]
    pub spawned: bool,
}

/// Creates `echo` children and completes once they have all finished.
pub struct FanOutHandler;

impl FanOutHandler {
    pub const TASK_TYPE: &'static str = "fan_out";
}

#[async_trait]
impl TaskHandler for FanOutHandler {
    async fn handle(&self, ctx: &mut TaskContext<'_>, state: Value) -> TaskResult {
        let mut fan_out: FanOutState = match serde_json::from_value(state) {
            Ok(fan_out) => fan_out,
            Err(e) => return TaskResult::failed(format!("invalid fan_out state: {}", e)),
        };

        if !fan_out.spawned {
            for child in &fan_out.children {
                if let Err(e) = ctx
                    .create_child(EchoHandler::TASK_TYPE, Some(child.clone()))
                    .await
                {
                    return TaskResult::failed(format!("failed to create child: {}", e));
                }
            }
            fan_out.spawned = true;
            info!(
                task_id = %ctx.task_id(),
                children = fan_out.children.len(),
                "Spawned children"
            );

            if fan_out.children.is_empty() {
                return TaskResult::completed_with_state(summarize(&[]).unwrap_or_default());
            }
            return match serde_json::to_value(&fan_out) {
                Ok(state) => TaskResult::waiting(Some(state)),
                Err(e) => TaskResult::failed(format!("failed to encode state: {}", e)),
            };
        }

        let children = match ctx.lock_child_tasks().await {
            Ok(children) => children,
            Err(e) => return TaskResult::failed(format!("failed to list children: {}", e)),
        };

        match summarize(&children) {
            Some(summary) => TaskResult::completed_with_state(summary),
            None => TaskResult::waiting(None),
        }
    }
}

/// Summarizes finished children, or `None` while any is still outstanding.
pub fn summarize(children: &[Task]) -> Option<Value> {
    if !children.iter().all(Task::is_terminal) {
        return None;
    }

    let failed = children
        .iter()
        .filter(|child| child.status == TaskStatus::Failed)
        .count();
    let results: Vec<Value> = children
        .iter()
        .map(|child| {
            json!({
                "id": child.id,
                "status": child.status,
                "state": child.state,
                "error": child.error,
            })
        })
        .collect();

    Some(json!({
        "children": results.len(),
        "failed": failed,
        "results": results,
    }))
}
