//! Durable task scheduling on PostgreSQL.
//!
//! This module provides the scheduler that runs on top of `storage`:
//!
//! - **Registry**: Maps task types to handlers
//! - **Scanner**: Claims tasks under short leases and dispatches them
//! - **WorkerPool**: Runs handlers inside transactions and commits outcomes
//! - **Heartbeat**: Keeps leases alive while handlers run
//! - **NotificationListener**: Turns `NOTIFY` bursts into single rescans
//!
//! # Architecture
//!
//! ```text
//!   create / resume ──► tasks table ──► NOTIFY tasks
//!                                           │
//!                                    ┌──────▼───────┐
//!                                    │   Listener   │
//!                                    └──────┬───────┘
//!                                           │ wake (capacity 1)
//!                                    ┌──────▼───────┐
//!                     idle slots ───►│   Scanner    │── claim (SKIP LOCKED)
//!                                    └──────┬───────┘
//!         ┌─────────────────────────────────┼──────────────────────┐
//!         ▼                                 ▼                      ▼
//!    ┌─────────┐                       ┌─────────┐            ┌─────────┐
//!    │ Worker 1│                       │ Worker 2│            │ Worker N│
//!    └─────────┘                       └─────────┘            └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use leasehold::scheduler::{Registry, Scheduler, SchedulerConfig};
//! use leasehold::builtin::EchoHandler;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(Registry::new());
//! registry.register(EchoHandler::TASK_TYPE, EchoHandler)?;
//!
//! let handle = Scheduler::start(pool, registry, SchedulerConfig::new(4)).await?;
//! // ...
//! handle.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Leases**: A claimed task belongs to one worker until its lease
//!   expires; expired leases are claimable again, which is how crashed
//!   workers' tasks are recovered
//! - **At-least-once**: A handler may run more than once for the same task
//! - **Atomic outcomes**: Handler writes and the status change commit together

pub mod backoff;
pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod listener;
pub mod registry;
pub mod runtime;
pub mod scanner;
pub mod task;
pub mod wake;
pub mod worker_pool;

// Re-export main types for convenience
pub use backoff::{Backoff, BackoffConfig};
pub use config::{LeaseSettings, SchedulerConfig};
pub use handler::{TaskContext, TaskHandler};
pub use heartbeat::{Heartbeat, LeaseKeeper};
pub use listener::NotificationListener;
pub use registry::Registry;
pub use runtime::{start_handlers, Scheduler, SchedulerHandle};
pub use scanner::{unhandled_type_message, ClaimSource, Scanner};
pub use task::{
    ClaimOutcome, ClaimedTask, Task, TaskId, TaskResult, TaskStatus, Transition, WorkerId,
    CANCELLED_ERROR,
};
pub use wake::{wake_channel, WakeReceiver, WakeSignal};
pub use worker_pool::{Assignment, PoolStats, Worker, WorkerPool, WorkerSlot};
