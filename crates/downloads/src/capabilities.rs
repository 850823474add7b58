//! Host capabilities the download engine depends on.
//!
//! Each trait is a small, fixed set of operations supplied at construction.
//! Tests substitute fakes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mediasync_core::{Attachment, AttachmentSlot, DownloadedContent, Message, MessageId};

use crate::backfill::BackfillRequest;
use crate::progress::ProgressReporter;

/// Which rendition of an attachment to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadVariant {
    Full,
    /// Small preview replica stored in the remote backup.
    BackupThumbnail,
}

/// Per-download options handed to the transport.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub has_media_backups: bool,
    /// Checked around every suspension point.
    pub cancellation: CancellationToken,
    pub progress: Option<ProgressReporter>,
}

/// Failure of a byte transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No normal path can deliver the content.
    #[error("attachment is permanently undownloadable")]
    PermanentlyUndownloadable,
    #[error("download cancelled")]
    Cancelled,
    #[error("transient transport failure: {0}")]
    Transient(String),
}

impl TransportError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}

/// Message persistence error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Download, decrypt and store attachment content.
#[async_trait]
pub trait AttachmentTransport: Send + Sync {
    async fn download(
        &self,
        attachment: &Attachment,
        variant: DownloadVariant,
        options: DownloadOptions,
    ) -> Result<DownloadedContent, TransportError>;
}

/// Owning-message persistence. The stored attachment record is what the UI
/// renders from.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn message(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError>;

    /// Replace the attachment in `slot` on message `id`.
    async fn save_attachment(
        &self,
        id: &MessageId,
        slot: &AttachmentSlot,
        attachment: Attachment,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to the application data directory.
    async fn free_bytes(&self) -> std::io::Result<u64>;
}

/// Host application state and notifications.
pub trait HostEnvironment: Send + Sync {
    /// Queued downloads hold off during calls.
    fn is_in_call(&self) -> bool;

    fn has_media_backups(&self) -> bool;

    /// Remote feature flag for backfill from linked devices.
    fn is_backfill_enabled(&self) -> bool;

    /// Backup import paused for lack of disk space.
    fn notify_low_disk_space(&self, bytes_needed: u64);

    /// A manual download failed and nothing else will recover it.
    fn notify_download_failed(&self, message_id: &MessageId);
}

/// Outbound channel to linked devices.
#[async_trait]
pub trait BackfillTransport: Send + Sync {
    async fn send(&self, request: &BackfillRequest) -> Result<(), TransportError>;
}

/// Bundle of capabilities supplied at construction.
#[derive(Clone)]
pub struct Capabilities {
    pub transport: Arc<dyn AttachmentTransport>,
    pub messages: Arc<dyn MessageRepository>,
    pub disk: Arc<dyn DiskSpaceProbe>,
    pub host: Arc<dyn HostEnvironment>,
    pub backfill: Arc<dyn BackfillTransport>,
}
