//! Body of one attachment download attempt.

use mediasync_core::{
    Attachment, AttachmentSlot, AttachmentTransition, AttachmentType, BackupThumbnail,
    DownloadSource, KIBIBYTE, Message, attachment::BACKUP_THUMBNAIL_CONTENT_TYPE,
};
use mediasync_jobs::{JobOutcome, JobRecord, RunContext};
use tracing::{debug, info, warn};

use crate::capabilities::{DownloadOptions, DownloadVariant, RepositoryError, TransportError};
use crate::job::AttachmentDownloadJob;
use crate::manager::DownloadShared;
use crate::progress::{ProgressTarget, ProgressWriter};

#[derive(Debug, thiserror::Error)]
enum DownloadFailure {
    #[error("attachment exceeds the maximum size")]
    TooBig,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

enum Fetched {
    Full,
    /// Only the backup thumbnail was fetched; the full download follows.
    Thumbnail(Attachment),
}

/// One attempt at `job`, as seen by the scheduler.
pub(crate) async fn run_download_job(
    shared: &DownloadShared,
    job: JobRecord<AttachmentDownloadJob>,
    ctx: RunContext,
) -> anyhow::Result<JobOutcome<AttachmentDownloadJob>> {
    let data = job.data;
    let logging_id = data.job_id_for_logging();
    let messages = &shared.capabilities.messages;

    let Some(message) = messages.message(&data.message_id).await? else {
        info!(job = %logging_id, "message no longer exists, dropping download");
        return Ok(JobOutcome::finished());
    };
    let slot = data.slot();
    let Some(current) = message.attachment(&slot).cloned() else {
        info!(job = %logging_id, "attachment no longer on message, dropping download");
        return Ok(JobOutcome::finished());
    };

    let attempt = Attempt {
        shared,
        data: &data,
        slot: &slot,
        ctx: &ctx,
        logging_id: &logging_id,
    };

    match attempt.download(current.clone()).await {
        Ok(Fetched::Full) => {
            if data.source == DownloadSource::BackupImport {
                shared.backup_media.add_completed(data.ciphertext_size);
            }
            Ok(JobOutcome::finished())
        }
        Ok(Fetched::Thumbnail(attachment)) => {
            debug!(job = %logging_id, "thumbnail fetched, queueing full download");
            Ok(JobOutcome::finished_with(AttachmentDownloadJob {
                attachment,
                ..data.clone()
            }))
        }
        Err(failure) => attempt.fail(&message, current, failure).await,
    }
}

struct Attempt<'a> {
    shared: &'a DownloadShared,
    data: &'a AttachmentDownloadJob,
    slot: &'a AttachmentSlot,
    ctx: &'a RunContext,
    logging_id: &'a str,
}

impl Attempt<'_> {
    async fn save(&self, attachment: Attachment) -> Result<(), RepositoryError> {
        self.shared
            .capabilities
            .messages
            .save_attachment(&self.data.message_id, self.slot, attachment)
            .await
    }

    async fn save_or_warn(&self, attachment: Attachment) {
        if let Err(err) = self.save(attachment).await {
            warn!(job = %self.logging_id, error = %err, "failed to save attachment state");
        }
    }

    fn options(&self, has_media_backups: bool) -> DownloadOptions {
        DownloadOptions {
            has_media_backups,
            cancellation: self.ctx.cancellation.clone(),
            progress: None,
        }
    }

    async fn download(&self, attachment: Attachment) -> Result<Fetched, DownloadFailure> {
        let config = &self.shared.config;
        let max_bytes = config.max_attachment_size_kib.saturating_mul(KIBIBYTE);
        let max_text_bytes = config.max_text_attachment_size_kib.saturating_mul(KIBIBYTE);
        if attachment.size > max_bytes
            || (self.data.attachment_type == AttachmentType::LongMessage
                && attachment.size > max_text_bytes)
        {
            return Err(DownloadFailure::TooBig);
        }

        let host = &self.shared.capabilities.host;
        let has_media_backups = host.has_media_backups();
        let might_have_thumbnail = attachment.thumbnail_from_backup.is_none()
            && attachment.should_end_up_in_remote_backup(has_media_backups)
            && attachment.can_have_thumbnail()
            && !attachment.imported_from_local_backup;
        let prefer_thumbnail =
            might_have_thumbnail && self.shared.is_visible(&self.data.message_id);

        if prefer_thumbnail {
            match self.fetch_thumbnail(&attachment, has_media_backups).await {
                Ok(updated) => return Ok(Fetched::Thumbnail(updated)),
                Err(DownloadFailure::Transport(TransportError::Cancelled)) => {
                    return Err(TransportError::Cancelled.into());
                }
                Err(err) => {
                    warn!(job = %self.logging_id, error = %err, "backup thumbnail unavailable");
                }
            }
        }

        self.save(attachment.transition(AttachmentTransition::DownloadStarted))
            .await?;

        if self.data.source != DownloadSource::Backfill
            && attachment.is_permanently_undownloadable_without_backfill()
        {
            return Err(TransportError::PermanentlyUndownloadable.into());
        }

        match self.fetch_full(&attachment, has_media_backups).await {
            Ok(()) => Ok(Fetched::Full),
            Err(err) => {
                let cancelled = self.ctx.cancellation.is_cancelled()
                    || matches!(err, DownloadFailure::Transport(TransportError::Cancelled));
                if might_have_thumbnail && !prefer_thumbnail && !cancelled {
                    match self.fetch_thumbnail(&attachment, has_media_backups).await {
                        Ok(updated) => {
                            info!(job = %self.logging_id, error = %err, "full download failed, kept backup thumbnail");
                            return Ok(Fetched::Thumbnail(updated));
                        }
                        Err(thumb_err) => {
                            debug!(job = %self.logging_id, error = %thumb_err, "fallback thumbnail unavailable");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_full(
        &self,
        attachment: &Attachment,
        has_media_backups: bool,
    ) -> Result<(), DownloadFailure> {
        let capabilities = &self.shared.capabilities;
        let (reporter, writer) = ProgressWriter::spawn(
            ProgressTarget {
                messages: capabilities.messages.clone(),
                message_id: self.data.message_id.clone(),
                slot: self.slot.clone(),
                attachment: attachment.transition(AttachmentTransition::DownloadStarted),
            },
            self.shared.config.progress_interval,
            self.ctx.cancellation.clone(),
        );

        let mut options = self.options(has_media_backups);
        options.progress = Some(reporter);
        let result = capabilities
            .transport
            .download(attachment, DownloadVariant::Full, options)
            .await;
        writer.finish().await;

        let content = result?;
        if self.ctx.cancellation.is_cancelled() {
            return Err(TransportError::Cancelled.into());
        }
        self.save(attachment.transition(AttachmentTransition::Downloaded(content)))
            .await?;
        info!(job = %self.logging_id, "attachment downloaded");
        Ok(())
    }

    async fn fetch_thumbnail(
        &self,
        attachment: &Attachment,
        has_media_backups: bool,
    ) -> Result<Attachment, DownloadFailure> {
        let content = self
            .shared
            .capabilities
            .transport
            .download(
                attachment,
                DownloadVariant::BackupThumbnail,
                self.options(has_media_backups),
            )
            .await?;
        let updated = attachment.transition(AttachmentTransition::BackupThumbnailFetched(
            BackupThumbnail {
                content_type: BACKUP_THUMBNAIL_CONTENT_TYPE.to_string(),
                path: content.path,
                size: content.size,
            },
        ));
        self.save(updated.clone()).await?;
        debug!(job = %self.logging_id, "backup thumbnail fetched");
        Ok(updated)
    }

    /// Map a failed attempt onto a record transition and a scheduler outcome.
    async fn fail(
        &self,
        message: &Message,
        attachment: Attachment,
        failure: DownloadFailure,
    ) -> anyhow::Result<JobOutcome<AttachmentDownloadJob>> {
        // Pick up writes made during the attempt (thumbnail, progress).
        let message = match self.shared.capabilities.messages.message(&message.id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => message.clone(),
            Err(err) => {
                warn!(job = %self.logging_id, error = %err, "failed to reload message");
                message.clone()
            }
        };
        let attachment = message.attachment(self.slot).cloned().unwrap_or(attachment);

        if self.ctx.cancellation.is_cancelled() {
            info!(job = %self.logging_id, "download cancelled");
            self.save_or_warn(attachment.transition(AttachmentTransition::DownloadInterrupted))
                .await;
            return Ok(JobOutcome::Cancelled);
        }

        match failure {
            DownloadFailure::TooBig => {
                warn!(
                    job = %self.logging_id,
                    size = attachment.size,
                    "attachment too big, not downloading"
                );
                self.save(attachment.transition(AttachmentTransition::TooBig))
                    .await?;
                Ok(JobOutcome::finished())
            }
            DownloadFailure::Transport(TransportError::PermanentlyUndownloadable) => {
                let backfill = &self.shared.backfill;
                let can_backfill = self.data.is_manual_download
                    && self.data.source != DownloadSource::Backfill
                    && backfill.is_enabled_for(self.data.attachment_type);

                let errored = attachment.transition(AttachmentTransition::PermanentlyErrored {
                    backfill_error: false,
                });
                self.save_or_warn(errored.clone()).await;

                if can_backfill {
                    info!(job = %self.logging_id, "attachment undownloadable, requesting backfill");
                    let mut message = message;
                    message.replace_attachment(self.slot, errored);
                    match backfill.request(&message).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            warn!(job = %self.logging_id, "nothing on the message can be backfilled");
                            self.notify_host_failed();
                        }
                        Err(err) => {
                            warn!(job = %self.logging_id, error = %err, "backfill request failed");
                            self.notify_host_failed();
                        }
                    }
                } else {
                    warn!(job = %self.logging_id, "attachment permanently undownloadable");
                    self.notify_failed();
                }
                Ok(JobOutcome::finished())
            }
            DownloadFailure::Transport(TransportError::Cancelled) => {
                // Aborted by the transport itself; the user can retry by hand.
                info!(job = %self.logging_id, "download aborted by transport");
                self.save_or_warn(attachment.transition(AttachmentTransition::DownloadInterrupted))
                    .await;
                Ok(JobOutcome::finished())
            }
            err @ (DownloadFailure::Transport(TransportError::Transient(_))
            | DownloadFailure::Repository(_)) => {
                if self.ctx.is_last_attempt {
                    warn!(
                        job = %self.logging_id,
                        attempt = self.ctx.attempt,
                        error = %err,
                        "download failed on last attempt"
                    );
                    self.save_or_warn(attachment.transition(AttachmentTransition::TransientlyErrored))
                        .await;
                    self.notify_failed();
                    Ok(JobOutcome::finished())
                } else {
                    info!(
                        job = %self.logging_id,
                        attempt = self.ctx.attempt,
                        error = %err,
                        "download failed, will retry"
                    );
                    self.save_or_warn(attachment.transition(AttachmentTransition::DownloadInterrupted))
                        .await;
                    Ok(JobOutcome::Retry)
                }
            }
        }
    }

    /// Tell the user when a manual download failed and backfill cannot help.
    fn notify_failed(&self) {
        let backfill_available = self.data.source != DownloadSource::Backfill
            && self.shared.backfill.is_enabled_for(self.data.attachment_type);
        if self.data.is_manual_download && !backfill_available {
            self.notify_host_failed();
        }
    }

    fn notify_host_failed(&self) {
        self.shared
            .capabilities
            .host
            .notify_download_failed(&self.data.message_id);
    }
}
