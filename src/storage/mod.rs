//! PostgreSQL persistent storage for tasks.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **tasks**: Task operations over a single connection, usable inside a
//!   handler's transaction
//! - **TaskStore**: Pool-level wrapper plus claiming and lease renewal
//! - **Migrations**: Schema management and versioning
//! - **StorageConfig**: Connection settings, from code or the environment
//!
//! # Usage
//!
//! ```rust,ignore
//! use leasehold::storage::{StorageConfig, TaskStore};
//!
//! let store = TaskStore::connect(&StorageConfig::from_env()?).await?;
//! store.run_migrations().await?;
//!
//! let id = store.create("echo", Some(serde_json::json!({"msg": "hi"}))).await?;
//! let task = store.get(id).await?;
//! ```

pub mod channel;
pub mod config;
pub mod database;
pub mod migrations;
pub mod schema;
pub mod tasks;

// Re-export main types for convenience
pub use channel::{Channel, DEFAULT_CHANNEL};
pub use config::StorageConfig;
pub use database::TaskStore;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
