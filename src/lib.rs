//! leasehold: Durable task scheduling on PostgreSQL.
//!
//! Tasks are rows in a single table. Workers claim them under time-limited
//! leases, run a registered handler inside a transaction, and commit the
//! handler's writes together with the task's next status. Tasks can spawn
//! children, park in `waiting`, and are resumed when their last child
//! finishes.

// Core modules
pub mod builtin;
pub mod cli;
pub mod error;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{ConfigError, RegistryError, SchedulerError, TaskError};
