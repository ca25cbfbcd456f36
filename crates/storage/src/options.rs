//! Engine configuration.
//!
//! Every knob has a production default; `from_env` overlays `JOBVAULT_*`
//! environment variables (durations in milliseconds).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Backoff strategy for polling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between polls
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Delay schedule for a polling loop that finds nothing to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollBackoff {
    /// Delay after the first empty poll
    pub base: Duration,
    /// Maximum delay cap
    pub max: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(25),
            max: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl PollBackoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay after the given number of consecutive empty polls (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Storage engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// How long a claimed queue entry stays invisible before it may be
    /// re-claimed (worker presumed dead).
    pub fetch_timeout: Duration,
    /// How long `dequeue` keeps polling before returning nothing.
    pub dequeue_wait_timeout: Duration,
    pub queue_poll_backoff: PollBackoff,
    /// Sleep between attempts to take a held lock.
    pub lock_poll_interval: Duration,
    /// After this long without refresh a lock counts as abandoned.
    pub lock_lifetime: Duration,
    pub sweep_interval: Duration,
    /// Records deleted per store per transaction during a sweep.
    pub sweep_batch_size: usize,
    /// How long a sweep waits for the sweeper lock before skipping the pass.
    pub sweep_lock_timeout: Duration,
    /// Servers silent for longer than this are evicted.
    pub server_timeout: Duration,
    pub server_check_interval: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30 * 60),
            dequeue_wait_timeout: Duration::from_secs(15),
            queue_poll_backoff: PollBackoff::default(),
            lock_poll_interval: Duration::from_millis(50),
            lock_lifetime: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
            sweep_batch_size: 1000,
            sweep_lock_timeout: Duration::from_secs(1),
            server_timeout: Duration::from_secs(5 * 60),
            server_check_interval: Duration::from_secs(60),
        }
    }
}

impl StorageOptions {
    /// Defaults overlaid with `JOBVAULT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();

        let millis = |key: &str, target: &mut Duration| {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<u64>() {
                    Ok(ms) => *target = Duration::from_millis(ms),
                    Err(_) => warn!(key, value = %raw, "ignoring invalid duration (expected milliseconds)"),
                }
            }
        };

        millis("JOBVAULT_FETCH_TIMEOUT_MS", &mut options.fetch_timeout);
        millis("JOBVAULT_DEQUEUE_WAIT_TIMEOUT_MS", &mut options.dequeue_wait_timeout);
        millis("JOBVAULT_QUEUE_POLL_BASE_MS", &mut options.queue_poll_backoff.base);
        millis("JOBVAULT_QUEUE_POLL_MAX_MS", &mut options.queue_poll_backoff.max);
        millis("JOBVAULT_LOCK_POLL_INTERVAL_MS", &mut options.lock_poll_interval);
        millis("JOBVAULT_LOCK_LIFETIME_MS", &mut options.lock_lifetime);
        millis("JOBVAULT_SWEEP_INTERVAL_MS", &mut options.sweep_interval);
        millis("JOBVAULT_SWEEP_LOCK_TIMEOUT_MS", &mut options.sweep_lock_timeout);
        millis("JOBVAULT_SERVER_TIMEOUT_MS", &mut options.server_timeout);
        millis("JOBVAULT_SERVER_CHECK_INTERVAL_MS", &mut options.server_check_interval);

        if let Some(raw) = lookup("JOBVAULT_SWEEP_BATCH_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => options.sweep_batch_size = n,
                _ => warn!(value = %raw, "ignoring invalid JOBVAULT_SWEEP_BATCH_SIZE"),
            }
        }

        if let Some(raw) = lookup("JOBVAULT_QUEUE_POLL_STRATEGY") {
            match raw.parse::<BackoffStrategy>() {
                Ok(strategy) => options.queue_poll_backoff.strategy = strategy,
                Err(error) => warn!(%error, "ignoring invalid JOBVAULT_QUEUE_POLL_STRATEGY"),
            }
        }

        options
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_dequeue_wait_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_wait_timeout = timeout;
        self
    }

    pub fn with_queue_poll_backoff(mut self, backoff: PollBackoff) -> Self {
        self.queue_poll_backoff = backoff;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_lock_lifetime(mut self, lifetime: Duration) -> Self {
        self.lock_lifetime = lifetime;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size.max(1);
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn with_server_check_interval(mut self, interval: Duration) -> Self {
        self.server_check_interval = interval;
        self
    }
}
