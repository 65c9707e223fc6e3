//! Error types for leasehold operations.
//!
//! Defines the error types for each subsystem:
//! - Task storage and the public task API
//! - Handler registration
//! - Configuration loading and validation
//! - Scheduler startup and shutdown

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::{TaskId, TaskStatus, WorkerId};
use crate::storage::MigrationError;

/// Errors returned by task storage operations and the task API.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Unknown task status {0:?}")]
    UnknownStatus(String),

    #[error("handler returned invalid status '{0}'")]
    InvalidOutcome(TaskStatus),

    #[error("Task {task_id} is no longer leased by worker {worker_id}")]
    LeaseLost { task_id: TaskId, worker_id: WorkerId },

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error(
        "Invalid notification channel {0:?}: must be an SQL identifier of at most 63 characters"
    )]
    InvalidChannel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while registering handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler already registered for task type {0:?}")]
    AlreadyRegistered(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),

    #[error("malformed environment variable {name}={value:?}: {reason}")]
    MalformedEnvVar {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur when starting or stopping the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to connect to database: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Failed to LISTEN on channel {channel:?}: {source}")]
    Listen {
        channel: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskError::NotFound(TaskId::new(42));
        assert_eq!(err.to_string(), "Task 42 not found");

        let err = TaskError::InvalidOutcome(TaskStatus::Running);
        assert_eq!(err.to_string(), "handler returned invalid status 'running'");

        let err = TaskError::LeaseLost {
            task_id: TaskId::new(7),
            worker_id: WorkerId::from("worker-a"),
        };
        assert!(err.to_string().contains("worker-a"));
    }

    #[test]
    fn test_registry_error_quotes_type() {
        let err = RegistryError::AlreadyRegistered("ingest".to_string());
        assert_eq!(
            err.to_string(),
            "handler already registered for task type \"ingest\""
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MalformedEnvVar {
            name: "LEASEHOLD_POSTGRES_PORT".to_string(),
            value: "abc".to_string(),
            reason: "invalid digit found in string".to_string(),
        };
        assert!(err.to_string().contains("LEASEHOLD_POSTGRES_PORT"));
        assert!(err.to_string().contains("\"abc\""));
    }

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}
