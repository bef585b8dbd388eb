//! Exponential backoff between connection attempts

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after every wait
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Used by a tunnel reconnecting itself after a failed health check
    pub fn tunnel_reconnect() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }

    /// Used by pools when establishing or restoring tunnels
    pub fn pool_connect() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 1.5,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::tunnel_reconnect()
    }
}

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Backoff cancelled")]
    Cancelled,
}

/// Stateful backoff sequence
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then grow it. Returns early with an
    /// error when `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), BackoffError> {
        self.attempt += 1;

        debug!(
            "Waiting {}ms before attempt {}",
            self.current_backoff.as_millis(),
            self.attempt + 1
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
            _ = sleep(self.current_backoff) => {}
        }

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Number of waits so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay the next [`wait`](Self::wait) will sleep for
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
