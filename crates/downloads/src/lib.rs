//! Attachment download engine.
//!
//! Specializes the generic job manager for attachment downloads: job
//! identity and priority, retry policy selection, disk-space backpressure,
//! outcome classification, thumbnail fallback, and escalation of
//! unreachable attachments to a linked device (backfill).
//!
//! Every side effect goes through the capability traits in
//! [`capabilities`], supplied at construction.

pub mod backfill;
pub mod backup_media;
pub mod capabilities;
pub mod config;
pub mod job;
pub mod manager;
pub mod progress;
mod runner;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod testing;


pub use backfill::{
    BackfillAttachmentResult, BackfillCoordinator, BackfillError, BackfillOutcome,
    BackfillRequest, BackfillResponse, BackfillStatus,
};
pub use backup_media::BackupMediaProgress;
pub use capabilities::{
    AttachmentTransport, BackfillTransport, Capabilities, DiskSpaceProbe, DownloadOptions,
    DownloadVariant, HostEnvironment, MessageRepository, RepositoryError, TransportError,
};
pub use config::DownloadConfig;
pub use job::{AttachmentDownloadJob, DownloadJobQuery, DownloadUrgency, NewAttachmentDownload};
pub use manager::{AttachmentDownloadManager, DownloadPolicy};
pub use progress::ProgressReporter;

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteJobStore;
