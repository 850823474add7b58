//! Job manager configuration.

use std::time::Duration;

/// Insert coalescing window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Longest time an insert waits before being written.
    pub wait: Duration,
    /// Pending inserts that trigger an immediate write.
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(150),
            max_size: 1000,
        }
    }
}

/// Job manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    /// Name for logging
    pub name: String,
    pub max_concurrent_jobs: usize,
    /// Fallback scheduling pass interval
    pub tick_interval: Duration,
    pub batch: BatchConfig,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            name: "job-manager".to_string(),
            max_concurrent_jobs: 3,
            tick_interval: Duration::from_secs(60),
            batch: BatchConfig::default(),
        }
    }
}

impl JobManagerConfig {
    /// Defaults overridden by `MEDIASYNC_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_parse::<usize>("MEDIASYNC_MAX_CONCURRENT_JOBS") {
            config = config.with_max_concurrent_jobs(max);
        }
        if let Some(ms) = env_parse::<u64>("MEDIASYNC_TICK_INTERVAL_MS") {
            config = config.with_tick_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("MEDIASYNC_BATCH_WAIT_MS") {
            config.batch.wait = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("MEDIASYNC_BATCH_MAX_SIZE") {
            config.batch.max_size = size.max(1);
        }
        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// At least one job always runs.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }
}

pub(crate) fn env_parse<V: std::str::FromStr>(key: &str) -> Option<V> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = JobManagerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.batch.wait, Duration::from_millis(150));
        assert_eq!(config.batch.max_size, 1000);
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = JobManagerConfig::default()
            .with_max_concurrent_jobs(0)
            .with_tick_interval(Duration::ZERO);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert!(config.tick_interval > Duration::ZERO);
    }
}
