use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SwarmError};

/// Tunables for the controller's loops and lifecycle rules.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// An Online agent with no heartbeat for this long becomes Unreachable.
    pub heartbeat_timeout_ms: u64,
    /// An Active assignment with no progress report for this long times out.
    pub progress_timeout_ms: u64,
    /// Number of failed attempts after which a task is failed for good.
    pub max_attempts: u32,
    /// Period of the scheduling loop.
    pub scheduling_interval_ms: u64,
    /// Period of the heartbeat/progress sweep loop.
    pub sweep_interval_ms: u64,
    /// Maximum number of ready tasks considered per scheduling cycle.
    pub batch_size: usize,
    /// How long an idle Unreachable agent is kept before it is Removed.
    pub unreachable_grace_ms: u64,
    /// Upper bound on non-terminal tasks held by the queue.
    pub max_queued_tasks: usize,
    /// Terminal tasks older than this are purged from the queue by the sweep.
    /// `None` keeps them forever.
    pub finished_retention_ms: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 5_000,
            progress_timeout_ms: 30_000,
            max_attempts: 3,
            scheduling_interval_ms: 100,
            sweep_interval_ms: 1_000,
            batch_size: 64,
            unreachable_grace_ms: 60_000,
            max_queued_tasks: 10_000,
            finished_retention_ms: Some(3_600_000),
        }
    }
}

fn chrono_ms(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl ControllerConfig {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono_ms(self.heartbeat_timeout_ms)
    }

    pub fn progress_timeout(&self) -> chrono::Duration {
        chrono_ms(self.progress_timeout_ms)
    }

    pub fn unreachable_grace(&self) -> chrono::Duration {
        chrono_ms(self.unreachable_grace_ms)
    }

    pub fn finished_retention(&self) -> Option<chrono::Duration> {
        self.finished_retention_ms.map(chrono_ms)
    }

    pub fn scheduling_interval(&self) -> Duration {
        Duration::from_millis(self.scheduling_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_progress_timeout_ms(mut self, ms: u64) -> Self {
        self.progress_timeout_ms = ms;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_scheduling_interval_ms(mut self, ms: u64) -> Self {
        self.scheduling_interval_ms = ms;
        self
    }

    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_max_queued_tasks(mut self, max: usize) -> Self {
        self.max_queued_tasks = max;
        self
    }

    /// Reject settings that would stall the loops or make every task fail.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("progress_timeout_ms", self.progress_timeout_ms),
            ("scheduling_interval_ms", self.scheduling_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SwarmError::Config(format!("{} must be greater than zero", name)));
        }
        if self.max_attempts == 0 {
            return Err(SwarmError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SwarmError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_queued_tasks == 0 {
            return Err(SwarmError::Config(
                "max_queued_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for the `server` subcommand.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub controller: ControllerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            controller: ControllerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }
}
