//! Persistent, concurrent job runner with retry and backoff.
//!
//! ## Design
//!
//! - Jobs are durable records keyed by a deterministic id (upsert on add)
//! - Bounded concurrency through a counting semaphore
//! - Retry with exponential backoff, finite or unlimited attempts
//! - Cooperative cancellation; stopped jobs resume after restart
//! - Crash recovery: every job is marked inactive at start
//!
//! ## Components
//!
//! - `JobRecord`: the stored unit of work plus scheduling metadata
//! - `JobStore`: persistence (in-memory here, durable stores elsewhere)
//! - `JobHandler`: host policy (identity, retry, priority, job body)
//! - `JobManager`: the scheduler

pub mod batcher;
pub mod config;
pub mod manager;
pub mod store;
pub mod types;

pub use batcher::{BatchSink, Batcher};
pub use config::{BatchConfig, JobManagerConfig};
pub use manager::{AddJobOptions, JobHandler, JobManager, JobManagerError};
pub use store::{InMemoryJobStore, JobSelector, JobStore, JobStoreError};
pub use types::{
    AttemptLimit, BackoffConfig, JobId, JobOutcome, JobRecord, RetryConfig, RunContext,
};
pub use tokio_util::sync::CancellationToken;
