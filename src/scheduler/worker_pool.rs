//! Worker pool for executing claimed tasks.
//!
//! Workers do not poll. Each idle worker announces itself on the shared
//! `available` channel with a `WorkerSlot`; the scanner claims a task on
//! that worker's behalf and sends it to the worker's inbox. A worker runs
//! one task at a time:
//!
//! 1. Open a READ COMMITTED execution transaction
//! 2. Start the heartbeat
//! 3. Run the handler with a `TaskContext` over the transaction
//! 4. Stop the heartbeat
//! 5. Apply the outcome (only if the lease is still held) and commit
//!
//! Any error along the way rolls the whole run back; the task stays leased
//! until its lease expires and is then claimed again.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::storage::{tasks, TaskStore};

use super::config::LeaseSettings;
use super::handler::{TaskContext, TaskHandler};
use super::heartbeat::Heartbeat;
use super::task::{ClaimedTask, TaskStatus, Transition, WorkerId};

/// An idle worker offering to take one task.
#[derive(Debug)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    pub inbox: mpsc::Sender<Assignment>,
}

/// A claimed task and the handler that will run it.
pub struct Assignment {
    pub task: ClaimedTask,
    pub handler: Arc<dyn TaskHandler>,
}

impl std::fmt::Debug for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assignment").field("task", &self.task).finish()
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a handler.
    pub active_workers: usize,
    /// Runs that committed `completed`.
    pub tasks_completed: u64,
    /// Runs that committed `failed`.
    pub tasks_failed: u64,
    /// Runs that committed `waiting`.
    pub tasks_waiting: u64,
    /// Runs that committed `pending`.
    pub tasks_requeued: u64,
    /// Runs rolled back (panic, invalid outcome, lost lease, database error).
    pub execution_errors: u64,
    /// Average handler run duration.
    pub average_run_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of runs, committed or not.
    pub fn total_runs(&self) -> u64 {
        self.tasks_completed
            + self.tasks_failed
            + self.tasks_waiting
            + self.tasks_requeued
            + self.execution_errors
    }

    /// Returns the share of terminal outcomes that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_waiting: AtomicU64,
    tasks_requeued: AtomicU64,
    execution_errors: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_transition(&self, status: TaskStatus, duration: Duration) {
        let counter = match status {
            TaskStatus::Completed => &self.tasks_completed,
            TaskStatus::Failed => &self.tasks_failed,
            TaskStatus::Waiting => &self.tasks_waiting,
            TaskStatus::Pending => &self.tasks_requeued,
            // Rejected before it is ever applied
            TaskStatus::Running => &self.execution_errors,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.record_duration(duration);
    }

    fn record_error(&self, duration: Duration) {
        self.execution_errors.fetch_add(1, Ordering::SeqCst);
        self.record_duration(duration);
    }

    fn record_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let stats = PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            tasks_waiting: self.tasks_waiting.load(Ordering::SeqCst),
            tasks_requeued: self.tasks_requeued.load(Ordering::SeqCst),
            execution_errors: self.execution_errors.load(Ordering::SeqCst),
            average_run_duration: Duration::ZERO,
        };

        let total_runs = stats.total_runs();
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        PoolStats {
            average_run_duration: if total_runs > 0 {
                Duration::from_millis(total_duration_ms / total_runs)
            } else {
                Duration::ZERO
            },
            ..stats
        }
    }
}

/// Fixed-size set of workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Spawns `num_workers` workers, each announcing itself on `available`.
    pub fn spawn(
        num_workers: usize,
        store: Arc<TaskStore>,
        lease: LeaseSettings,
        available: mpsc::Sender<WorkerSlot>,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = Arc::new(SharedPoolStats::default());

        let handles = (0..num_workers)
            .map(|_| {
                let worker = Worker::new(
                    Arc::clone(&store),
                    lease,
                    available.clone(),
                    shutdown.clone(),
                    Arc::clone(&stats),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        info!(num_workers = num_workers, "Worker pool started");

        Self { handles, stats }
    }

    pub(crate) fn stats(&self) -> Arc<SharedPoolStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

/// A single worker that executes tasks handed to it by the scanner.
pub struct Worker {
    /// Unique identifier for this worker.
    id: WorkerId,
    store: Arc<TaskStore>,
    lease: LeaseSettings,
    available: mpsc::Sender<WorkerSlot>,
    inbox_tx: mpsc::Sender<Assignment>,
    inbox_rx: mpsc::Receiver<Assignment>,
    shutdown: CancellationToken,
    /// Shared statistics.
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    fn new(
        store: Arc<TaskStore>,
        lease: LeaseSettings,
        available: mpsc::Sender<WorkerSlot>,
        shutdown: CancellationToken,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        Self {
            id: WorkerId::generate(),
            store,
            lease,
            available,
            inbox_tx,
            inbox_rx,
            shutdown,
            stats,
        }
    }

    /// Main worker loop: offer a slot, take the assignment, run it.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let slot = WorkerSlot {
                worker_id: self.id.clone(),
                inbox: self.inbox_tx.clone(),
            };

            let offered = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                offered = self.available.send(slot) => offered,
            };
            if offered.is_err() {
                debug!(worker_id = %self.id, "Scanner gone");
                break;
            }

            let assignment = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                assignment = self.inbox_rx.recv() => assignment,
            };
            match assignment {
                Some(assignment) => self.execute(assignment).await,
                None => break,
            }
        }

        if let Ok(assignment) = self.inbox_rx.try_recv() {
            warn!(
                worker_id = %self.id,
                task_id = %assignment.task.id,
                "Shutting down with an unstarted task; it will be reclaimed after its lease expires"
            );
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn execute(&self, assignment: Assignment) {
        let task_id = assignment.task.id;
        let task_type = assignment.task.task_type.clone();
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            task_type = %task_type,
            "Executing task"
        );

        self.stats.increment_active();
        let result = self.run_handler(assignment).await;
        let duration = start_time.elapsed();
        self.stats.decrement_active();

        match result {
            Ok(transition) => {
                self.stats.record_transition(transition.status, duration);
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    task_type = %task_type,
                    status = %transition.status,
                    resumed_parent = ?transition.resumed_parent.map(|id| id.get()),
                    duration_ms = duration.as_millis() as u64,
                    "Task run committed"
                );
            }
            Err(e) => {
                self.stats.record_error(duration);
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    task_type = %task_type,
                    error = %e,
                    "Task run rolled back; task will be retried after its lease expires"
                );
            }
        }
    }

    async fn run_handler(&self, assignment: Assignment) -> Result<Transition, TaskError> {
        let Assignment { task, handler } = assignment;
        let mut tx = self.store.begin_execution().await?;

        let heartbeat = Heartbeat::start(
            Arc::clone(&self.store),
            task.id,
            self.id.clone(),
            self.lease,
        );

        let outcome = {
            let mut ctx = TaskContext::new(
                &mut *tx,
                self.store.channel(),
                task.id,
                &task.task_type,
                &self.id,
                self.shutdown.clone(),
            );
            AssertUnwindSafe(handler.handle(&mut ctx, task.state))
                .catch_unwind()
                .await
        };

        heartbeat.stop().await;

        let result = outcome.map_err(|panic| TaskError::HandlerPanicked(panic_message(&*panic)))?;
        let transition =
            tasks::apply_result(&mut *tx, self.store.channel(), task.id, &self.id, &result).await?;
        tx.commit().await?;

        Ok(transition)
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
