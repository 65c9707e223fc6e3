//! Scheduler configuration.

use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::Channel;

use super::backoff::BackoffConfig;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(5 * 60);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Lease length and renewal cadence for in-flight tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// How long a claim or renewal keeps a task leased.
    pub duration: Duration,
    /// How often the heartbeat renews the lease.
    pub heartbeat_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            duration: DEFAULT_LEASE_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Configuration for a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks to spawn.
    pub workers: usize,
    pub lease: LeaseSettings,
    /// Notification channel to LISTEN on.
    pub channel: Channel,
    /// Rescan this often even without notifications, so leases that expired
    /// in crashed processes are picked up. `None` relies on notifications
    /// alone.
    pub fallback_rescan: Option<Duration>,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Retry policy for failed scans and listener errors.
    pub backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            lease: LeaseSettings::default(),
            channel: Channel::default(),
            fallback_rescan: Some(DEFAULT_LEASE_DURATION),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the lease duration. The fallback rescan follows it unless it was
    /// disabled.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        if self.fallback_rescan == Some(self.lease.duration) {
            self.fallback_rescan = Some(duration);
        }
        self.lease.duration = duration;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.lease.heartbeat_interval = interval;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_fallback_rescan(mut self, interval: Option<Duration>) -> Self {
        self.fallback_rescan = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Smallest connection pool this configuration can run on.
    ///
    /// Every busy worker holds a connection for its whole handler run and
    /// its heartbeat needs a second one to renew the lease. The scanner and
    /// the listener hold one each.
    pub fn required_connections(&self) -> u32 {
        let workers = u32::try_from(self.workers).unwrap_or(u32::MAX);
        workers.saturating_mul(2).saturating_add(2)
    }

    /// Rejects a pool too small to renew leases while every worker is busy.
    pub fn check_pool_size(&self, max_connections: u32) -> Result<(), ConfigError> {
        let required = self.required_connections();
        if max_connections < required {
            return Err(ConfigError::Invalid(format!(
                "{} workers need a pool of at least {} connections, got {}",
                self.workers, required, max_connections
            )));
        }
        Ok(())
    }

    /// Checks the settings can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "at least one worker is required".to_string(),
            ));
        }
        if self.lease.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.lease.heartbeat_interval >= self.lease.duration {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval ({:?}) must be shorter than the lease ({:?})",
                self.lease.heartbeat_interval, self.lease.duration
            )));
        }
        if self.fallback_rescan.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Invalid(
                "fallback rescan interval must be positive".to_string(),
            ));
        }
        if self.backoff.initial.is_zero() || self.backoff.factor < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff must start above zero and never shrink".to_string(),
            ));
        }
        Ok(())
    }
}
