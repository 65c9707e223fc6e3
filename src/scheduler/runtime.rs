//! Starting and stopping a scheduler.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::storage::{StorageConfig, TaskStore};

use super::config::SchedulerConfig;
use super::listener::NotificationListener;
use super::registry::Registry;
use super::scanner::Scanner;
use super::wake::{wake_channel, WakeSignal};
use super::worker_pool::{PoolStats, SharedPoolStats, WorkerPool};

/// Connects with `storage` and runs `worker_count` workers over `registry`
/// with default settings.
///
/// The pool is grown to `SchedulerConfig::required_connections` if
/// `storage.max_connections` is smaller.
pub async fn start_handlers(
    storage: &StorageConfig,
    registry: Arc<Registry>,
    worker_count: usize,
) -> Result<SchedulerHandle, SchedulerError> {
    let config = SchedulerConfig::new(worker_count);
    config.validate()?;
    let pool = storage
        .clone()
        .with_min_connections_for(config.required_connections())
        .connect()
        .await?;
    Scheduler::start(pool, registry, config).await
}

/// Entry point for running the listener, scanner and workers together.
pub struct Scheduler;

impl Scheduler {
    /// Starts a scheduler over `pool`.
    ///
    /// The listener subscribes before the first scan, so a task created
    /// between the two is still noticed.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if the settings are invalid or
    /// `pool` allows fewer than `config.required_connections()` connections.
    pub async fn start(
        pool: PgPool,
        registry: Arc<Registry>,
        config: SchedulerConfig,
    ) -> Result<SchedulerHandle, SchedulerError> {
        config.validate()?;
        config.check_pool_size(pool.options().get_max_connections())?;

        if registry.is_empty() {
            warn!("No handlers registered; workers will not claim any tasks until one is");
        }

        let store = Arc::new(TaskStore::new(pool.clone()).with_channel(config.channel.clone()));
        let shutdown = CancellationToken::new();
        let (wake, wake_rx) = wake_channel();

        let listener = NotificationListener::connect(
            &pool,
            config.channel.clone(),
            wake.clone(),
            config.backoff.clone(),
            shutdown.clone(),
        )
        .await?;

        let (available_tx, available_rx) = mpsc::channel(config.workers);
        let workers = WorkerPool::spawn(
            config.workers,
            Arc::clone(&store),
            config.lease,
            available_tx,
            shutdown.clone(),
        );
        let stats = workers.stats();

        let scanner = Scanner::new(
            store,
            registry,
            available_rx,
            wake_rx,
            config.lease.duration,
            config.fallback_rescan,
            config.backoff.clone(),
            shutdown.clone(),
        );

        let mut handles = workers.into_handles();
        handles.push(tokio::spawn(scanner.run()));
        handles.push(tokio::spawn(listener.run()));

        info!(
            workers = config.workers,
            channel = %config.channel,
            lease_secs = config.lease.duration.as_secs(),
            "Scheduler started"
        );

        Ok(SchedulerHandle {
            shutdown,
            handles,
            wake,
            stats,
            num_workers: config.workers,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

/// Control handle for a running scheduler.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    wake: WakeSignal,
    stats: Arc<SharedPoolStats>,
    num_workers: usize,
    shutdown_timeout: Duration,
}

impl SchedulerHandle {
    /// Token that stops the scheduler when cancelled.
    ///
    /// Cancelling it and then calling `wait` is equivalent to `shutdown`
    /// without the timeout.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Triggers a rescan as if a notification had arrived.
    pub fn wake(&self) {
        self.wake.notify();
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers)
    }

    /// Waits until every component has exited.
    ///
    /// Components exit once the cancellation token is cancelled and any
    /// running handlers have returned.
    pub async fn wait(self) {
        join_all(self.handles).await;
    }

    /// Stops claiming new work and waits for in-flight handlers to finish.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` if components don't stop
    /// within the configured timeout. Handlers still running at that point
    /// keep running detached.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        info!("Initiating scheduler shutdown");
        self.shutdown.cancel();

        match tokio::time::timeout(self.shutdown_timeout, join_all(self.handles)).await {
            Ok(()) => {
                info!("Scheduler shutdown complete");
                Ok(())
            }
            Err(_) => Err(SchedulerError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task panicked during shutdown");
        }
    }
}
