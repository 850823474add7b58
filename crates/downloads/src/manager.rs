//! Attachment download manager: the generic job manager specialized with
//! download policy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use mediasync_core::{Attachment, DownloadSource, MessageId};
use mediasync_jobs::{
    AddJobOptions, JobHandler, JobId, JobManager, JobManagerError, JobOutcome, JobRecord,
    JobStore, RetryConfig, RunContext,
};

use crate::backfill::{BackfillCoordinator, BackfillError, BackfillResponse};
use crate::backup_media::{BackupMediaProgress, BackupMediaState};
use crate::capabilities::Capabilities;
use crate::config::DownloadConfig;
use crate::job::{AttachmentDownloadJob, DownloadJobQuery, DownloadUrgency, NewAttachmentDownload};
use crate::runner::run_download_job;

/// State shared between the manager handle and running job bodies.
pub(crate) struct DownloadShared {
    pub(crate) config: DownloadConfig,
    pub(crate) capabilities: Capabilities,
    pub(crate) backfill: BackfillCoordinator,
    pub(crate) backup_media: BackupMediaState,
    visible: RwLock<HashSet<MessageId>>,
    idled: AtomicBool,
}

impl DownloadShared {
    pub(crate) fn is_visible(&self, message_id: &MessageId) -> bool {
        self.visible
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(message_id)
    }

    fn visible_snapshot(&self) -> HashSet<MessageId> {
        self.visible
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pause backup imports when free space is short. Returns false when the
    /// job should go back to the queue.
    async fn has_room_for_backup_import(&self) -> bool {
        let threshold = self.config.minimum_free_disk_space();
        let free = match self.capabilities.disk.free_bytes().await {
            Ok(free) => free,
            Err(err) => {
                warn!(error = %err, "failed to read free disk space, proceeding");
                return true;
            }
        };

        if free > threshold {
            self.backup_media.leave_low_disk();
            return true;
        }

        if self.backup_media.enter_low_disk() {
            let remaining = self.backup_media.snapshot().remaining_bytes();
            warn!(free, threshold, remaining, "low disk space, pausing backup media download");
            self.capabilities.host.notify_low_disk_space(remaining);
        }
        false
    }
}

/// Download policy plugged into the generic job manager.
pub struct DownloadPolicy {
    shared: Arc<DownloadShared>,
}

#[async_trait]
impl JobHandler<AttachmentDownloadJob> for DownloadPolicy {
    type Query = DownloadJobQuery;

    fn job_id(&self, data: &AttachmentDownloadJob) -> JobId {
        data.job_id()
    }

    fn job_id_for_logging(&self, data: &AttachmentDownloadJob) -> String {
        data.job_id_for_logging()
    }

    fn retry_config(&self, data: &AttachmentDownloadJob) -> RetryConfig {
        let has_media_backups = self.shared.capabilities.host.has_media_backups();
        if data
            .attachment
            .should_end_up_in_remote_backup(has_media_backups)
        {
            self.shared.config.backup_retry.clone()
        } else {
            self.shared.config.standard_retry.clone()
        }
    }

    fn next_jobs_query(&self, limit: usize, now: DateTime<Utc>) -> DownloadJobQuery {
        let sources = self
            .shared
            .backup_media
            .is_paused()
            .then(|| vec![DownloadSource::Standard, DownloadSource::Backfill]);
        DownloadJobQuery {
            limit,
            now,
            prioritize: self.shared.visible_snapshot(),
            sources,
        }
    }

    async fn should_hold_off(&self) -> bool {
        self.shared.capabilities.host.is_in_call()
    }

    async fn run(
        &self,
        job: JobRecord<AttachmentDownloadJob>,
        ctx: RunContext,
    ) -> anyhow::Result<JobOutcome<AttachmentDownloadJob>> {
        if job.data.source == DownloadSource::BackupImport
            && !self.shared.has_room_for_backup_import().await
        {
            return Ok(JobOutcome::Retry);
        }
        run_download_job(&self.shared, job, ctx).await
    }
}

/// Schedules attachment downloads over a [`JobStore`].
///
/// Cheap to clone; clones share the same scheduler.
pub struct AttachmentDownloadManager<S>
where
    S: JobStore<AttachmentDownloadJob, DownloadJobQuery> + 'static,
{
    jobs: JobManager<AttachmentDownloadJob, DownloadPolicy, S>,
    shared: Arc<DownloadShared>,
}

impl<S> Clone for AttachmentDownloadManager<S>
where
    S: JobStore<AttachmentDownloadJob, DownloadJobQuery> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> AttachmentDownloadManager<S>
where
    S: JobStore<AttachmentDownloadJob, DownloadJobQuery> + 'static,
{
    pub fn new(config: DownloadConfig, capabilities: Capabilities, store: S) -> Self {
        let backfill = BackfillCoordinator::new(
            capabilities.messages.clone(),
            capabilities.backfill.clone(),
            capabilities.host.clone(),
        );
        let shared = Arc::new(DownloadShared {
            config,
            capabilities,
            backfill,
            backup_media: BackupMediaState::default(),
            visible: RwLock::new(HashSet::new()),
            idled: AtomicBool::new(false),
        });
        let policy = DownloadPolicy {
            shared: Arc::clone(&shared),
        };
        Self {
            jobs: JobManager::new(shared.config.jobs.clone(), policy, store),
            shared,
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &S {
        self.jobs.store()
    }

    pub fn backfill(&self) -> &BackfillCoordinator {
        &self.shared.backfill
    }

    pub fn is_running(&self) -> bool {
        self.jobs.is_running()
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs.active_job_count()
    }

    /// Whether the manager has drained its backlog since the last `start`.
    pub fn has_idled(&self) -> bool {
        self.shared.idled.load(Ordering::Acquire)
    }

    pub async fn start(&self) -> Result<(), JobManagerError> {
        self.shared.idled.store(false, Ordering::Release);
        self.jobs.start().await?;

        let shared = Arc::clone(&self.shared);
        self.jobs.wait_for_idle_then(move || {
            shared.idled.store(true, Ordering::Release);
            info!("attachment downloads idle");
        });
        Ok(())
    }

    pub async fn stop(&self) {
        self.jobs.stop().await;
    }

    /// Queue a download. Returns the attachment as the UI should now show it.
    ///
    /// Invalid requests and store failures are logged and leave the
    /// attachment unchanged.
    pub async fn add_job(&self, request: NewAttachmentDownload) -> Attachment {
        if request.source == DownloadSource::BackupImport && request.attachment.error {
            debug!(message_id = %request.message_id, "skipping backup import of errored attachment");
            return request.attachment;
        }

        let job = match AttachmentDownloadJob::from_request(&request) {
            Ok(job) => job,
            Err(err) => {
                error!(message_id = %request.message_id, error = %err, "invalid download request");
                return request.attachment;
            }
        };
        let logging_id = job.job_id_for_logging();
        let is_backup_import = job.source == DownloadSource::BackupImport;
        let ciphertext_size = job.ciphertext_size;

        let options = match request.urgency {
            DownloadUrgency::Immediate => AddJobOptions::forced(),
            DownloadUrgency::Standard => AddJobOptions::default(),
        };
        if let Err(err) = self.jobs.add_job(job, options).await {
            error!(job = %logging_id, error = %err, "failed to queue download");
            return request.attachment;
        }

        if is_backup_import {
            self.shared.backup_media.add_total(ciphertext_size);
        }
        Attachment {
            pending: true,
            ..request.attachment
        }
    }

    /// Cancel and delete every download matching `predicate`.
    pub async fn cancel_jobs<F>(&self, predicate: F) -> Result<usize, JobManagerError>
    where
        F: Fn(&AttachmentDownloadJob) -> bool,
    {
        self.jobs.cancel_jobs(|record| predicate(&record.data)).await
    }

    /// Replace the set of on-screen messages whose downloads go first.
    pub fn update_visible_messages(&self, message_ids: impl IntoIterator<Item = MessageId>) {
        let visible: HashSet<_> = message_ids.into_iter().collect();
        debug!(count = visible.len(), "updated visible messages");
        *self
            .shared
            .visible
            .write()
            .unwrap_or_else(PoisonError::into_inner) = visible;
    }

    pub async fn wait_for_idle(&self) {
        self.jobs.wait_for_idle().await;
    }

    pub fn wait_for_idle_then<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.wait_for_idle_then(callback);
    }

    pub async fn flush_batched_jobs(&self) {
        self.jobs.flush_batched_jobs().await;
    }

    /// Ask a linked device to re-upload the unreachable attachments on a
    /// message.
    pub async fn request_backfill(&self, message_id: &MessageId) -> Result<bool, BackfillError> {
        let Some(message) = self.shared.capabilities.messages.message(message_id).await? else {
            info!(%message_id, "cannot backfill a missing message");
            return Ok(false);
        };
        Ok(self.shared.backfill.request(&message).await?.is_some())
    }

    /// Apply a backfill response and queue the re-uploaded attachments.
    /// Returns how many downloads were queued.
    pub async fn handle_backfill_response(
        &self,
        response: BackfillResponse,
    ) -> Result<usize, BackfillError> {
        let downloads = self.shared.backfill.handle_response(response).await?;
        let count = downloads.len();
        for download in downloads {
            self.add_job(download).await;
        }
        Ok(count)
    }

    pub fn backup_media_progress(&self) -> BackupMediaProgress {
        self.shared.backup_media.snapshot()
    }

    pub fn pause_backup_media_download(&self) {
        info!("pausing backup media download");
        self.shared.backup_media.pause();
    }

    pub async fn resume_backup_media_download(&self) -> Result<(), JobManagerError> {
        info!("resuming backup media download");
        self.shared.backup_media.resume();
        if !self.is_running() {
            self.start().await?;
        }
        self.jobs.wake();
        Ok(())
    }

    /// Drop every queued backup download and clear its progress.
    pub async fn cancel_backup_media_download(&self) -> Result<usize, JobManagerError> {
        info!("cancelling backup media download");
        self.shared.backup_media.dismiss_banner();
        let cancelled = self
            .cancel_jobs(|job| job.original_source == DownloadSource::BackupImport)
            .await?;
        self.shared.backup_media.reset();
        Ok(cancelled)
    }

    pub fn dismiss_backup_media_banner(&self) {
        self.shared.backup_media.dismiss_banner();
    }
}
