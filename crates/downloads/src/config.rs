//! Download manager configuration.

use std::time::Duration;

use mediasync_core::KIBIBYTE;
use mediasync_jobs::{JobManagerConfig, RetryConfig};

/// Attachment download policy knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    /// Scheduler settings (concurrency, tick, batching).
    pub jobs: JobManagerConfig,
    pub max_attachment_size_kib: u64,
    /// Limit for `long-message` attachments.
    pub max_text_attachment_size_kib: u64,
    /// Free disk space required for backup imports, in multiples of the
    /// largest allowed attachment.
    pub free_space_multiplier: u64,
    /// Minimum gap between progress writes.
    pub progress_interval: Duration,
    /// Used unless the attachment is expected in the remote backup.
    pub standard_retry: RetryConfig,
    pub backup_retry: RetryConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            jobs: JobManagerConfig::default().with_name("attachment-downloads"),
            max_attachment_size_kib: 100 * 1024,
            max_text_attachment_size_kib: 5 * 1024,
            free_space_multiplier: 5,
            progress_interval: Duration::from_millis(200),
            standard_retry: RetryConfig::default(),
            backup_retry: RetryConfig::unlimited(),
        }
    }
}

impl DownloadConfig {
    /// Defaults overridden by `MEDIASYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            jobs: JobManagerConfig::from_env().with_name("attachment-downloads"),
            ..Self::default()
        };
        if let Some(kib) = env_parse("MEDIASYNC_MAX_ATTACHMENT_KIB") {
            config.max_attachment_size_kib = kib;
        }
        if let Some(kib) = env_parse("MEDIASYNC_MAX_TEXT_ATTACHMENT_KIB") {
            config.max_text_attachment_size_kib = kib;
        }
        config
    }

    pub fn with_jobs(mut self, jobs: JobManagerConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_max_attachment_size_kib(mut self, kib: u64) -> Self {
        self.max_attachment_size_kib = kib;
        self
    }

    pub fn with_max_text_attachment_size_kib(mut self, kib: u64) -> Self {
        self.max_text_attachment_size_kib = kib;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_standard_retry(mut self, retry: RetryConfig) -> Self {
        self.standard_retry = retry;
        self
    }

    pub fn with_backup_retry(mut self, retry: RetryConfig) -> Self {
        self.backup_retry = retry;
        self
    }

    /// Free bytes below which backup imports pause.
    pub fn minimum_free_disk_space(&self) -> u64 {
        self.max_attachment_size_kib
            .saturating_mul(KIBIBYTE)
            .saturating_mul(self.free_space_multiplier)
    }
}

fn env_parse(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediasync_jobs::AttemptLimit;

    #[test]
    fn defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.jobs.max_concurrent_jobs, 3);
        assert_eq!(config.progress_interval, Duration::from_millis(200));
        assert_eq!(config.standard_retry.max_attempts, AttemptLimit::Finite(5));
        assert_eq!(config.backup_retry.max_attempts, AttemptLimit::Unlimited);
        assert_eq!(config.backup_retry.backoff, config.standard_retry.backoff);
    }

    #[test]
    fn free_space_threshold_is_five_max_attachments() {
        let config = DownloadConfig::default().with_max_attachment_size_kib(1_000);
        assert_eq!(config.minimum_free_disk_space(), 1_000 * 1024 * 5);
    }
}
