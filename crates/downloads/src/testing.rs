//! Fakes for the capability traits plus a harness wiring them into a manager.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use mediasync_core::{
    Attachment, AttachmentSlot, AttachmentType, ConversationId, DownloadSource, DownloadedContent,
    Message, MessageAttachment, MessageId, ServiceId,
};
use mediasync_jobs::{
    BackoffConfig, BatchConfig, InMemoryJobStore, JobId, JobManagerConfig, JobRecord, JobStore,
    JobStoreError, RetryConfig,
};

use crate::backfill::BackfillRequest;
use crate::capabilities::{
    AttachmentTransport, BackfillTransport, Capabilities, DiskSpaceProbe, DownloadOptions,
    DownloadVariant, HostEnvironment, MessageRepository, RepositoryError, TransportError,
};
use crate::config::DownloadConfig;
use crate::job::{AttachmentDownloadJob, DownloadJobQuery, DownloadUrgency, NewAttachmentDownload};
use crate::manager::AttachmentDownloadManager;

type SaveFilter = Arc<dyn Fn(&AttachmentSlot, &Attachment) -> bool + Send + Sync>;

#[derive(Default)]
pub(crate) struct FakeMessages {
    messages: Mutex<HashMap<MessageId, Message>>,
    saved: Mutex<Vec<(AttachmentSlot, Attachment)>>,
    failing_saves: Mutex<Option<SaveFilter>>,
}

impl FakeMessages {
    pub(crate) fn put(&self, message: Message) {
        self.messages
            .lock()
            .unwrap()
            .insert(message.id.clone(), message);
    }

    pub(crate) fn get(&self, id: &MessageId) -> Option<Message> {
        self.messages.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn delete(&self, id: &MessageId) {
        self.messages.lock().unwrap().remove(id);
    }

    /// Every attachment write, in order.
    pub(crate) fn saved(&self) -> Vec<(AttachmentSlot, Attachment)> {
        self.saved.lock().unwrap().clone()
    }

    /// Reject every write for which `filter` returns true.
    pub(crate) fn fail_saves_when(
        &self,
        filter: impl Fn(&AttachmentSlot, &Attachment) -> bool + Send + Sync + 'static,
    ) {
        *self.failing_saves.lock().unwrap() = Some(Arc::new(filter));
    }

    /// Current record of the first attachment on `id`.
    pub(crate) fn first_attachment(&self, id: &MessageId) -> Attachment {
        self.get(id).unwrap().attachments[0].attachment.clone()
    }
}

#[async_trait]
impl MessageRepository for FakeMessages {
    async fn message(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self.get(id))
    }

    async fn save_attachment(
        &self,
        id: &MessageId,
        slot: &AttachmentSlot,
        attachment: Attachment,
    ) -> Result<(), RepositoryError> {
        let filter = self.failing_saves.lock().unwrap().clone();
        if filter.is_some_and(|reject| reject(slot, &attachment)) {
            return Err(RepositoryError::Storage("disk I/O error".to_string()));
        }
        self.saved
            .lock()
            .unwrap()
            .push((slot.clone(), attachment.clone()));
        if let Some(message) = self.messages.lock().unwrap().get_mut(id) {
            message.replace_attachment(slot, attachment);
        }
        Ok(())
    }
}

/// Scripted behaviour of one transport call.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Succeed,
    /// Report these byte counts, then succeed.
    SucceedWithProgress(Vec<u64>),
    Fail(TransportError),
    /// Park until the attempt is cancelled.
    BlockUntilCancelled,
}

/// Transport replaying scripted steps per variant. Unscripted calls succeed.
#[derive(Default)]
pub(crate) struct FakeTransport {
    full: Mutex<VecDeque<Step>>,
    thumbnail: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<DownloadVariant>>,
    pub(crate) started: Notify,
}

impl FakeTransport {
    pub(crate) fn script(&self, variant: DownloadVariant, steps: impl IntoIterator<Item = Step>) {
        let queue = match variant {
            DownloadVariant::Full => &self.full,
            DownloadVariant::BackupThumbnail => &self.thumbnail,
        };
        queue.lock().unwrap().extend(steps);
    }

    pub(crate) fn calls(&self) -> Vec<DownloadVariant> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, variant: DownloadVariant) -> usize {
        self.calls().into_iter().filter(|call| *call == variant).count()
    }
}

#[async_trait]
impl AttachmentTransport for FakeTransport {
    async fn download(
        &self,
        attachment: &Attachment,
        variant: DownloadVariant,
        options: DownloadOptions,
    ) -> Result<DownloadedContent, TransportError> {
        self.calls.lock().unwrap().push(variant);
        let step = match variant {
            DownloadVariant::Full => self.full.lock().unwrap().pop_front(),
            DownloadVariant::BackupThumbnail => self.thumbnail.lock().unwrap().pop_front(),
        };
        self.started.notify_waiters();

        let content = DownloadedContent {
            path: match variant {
                DownloadVariant::Full => "attachments/full".to_string(),
                DownloadVariant::BackupThumbnail => "attachments/thumb".to_string(),
            },
            size: attachment.size,
            content_type: None,
            plaintext_hash: None,
        };

        match step.unwrap_or(Step::Succeed) {
            Step::Succeed => Ok(content),
            Step::SucceedWithProgress(reports) => {
                if let Some(progress) = &options.progress {
                    for bytes in reports {
                        progress.report(bytes);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
                Ok(content)
            }
            Step::Fail(err) => Err(err),
            Step::BlockUntilCancelled => {
                options.cancellation.cancelled().await;
                Err(TransportError::Cancelled)
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeHost {
    in_call: AtomicBool,
    media_backups: AtomicBool,
    backfill_enabled: AtomicBool,
    low_disk: Mutex<Vec<u64>>,
    failed: Mutex<Vec<MessageId>>,
}

impl FakeHost {
    pub(crate) fn set_in_call(&self, value: bool) {
        self.in_call.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_media_backups(&self, value: bool) {
        self.media_backups.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_backfill_enabled(&self, value: bool) {
        self.backfill_enabled.store(value, Ordering::SeqCst);
    }

    pub(crate) fn low_disk_notices(&self) -> Vec<u64> {
        self.low_disk.lock().unwrap().clone()
    }

    pub(crate) fn failed_notices(&self) -> Vec<MessageId> {
        self.failed.lock().unwrap().clone()
    }
}

impl HostEnvironment for FakeHost {
    fn is_in_call(&self) -> bool {
        self.in_call.load(Ordering::SeqCst)
    }

    fn has_media_backups(&self) -> bool {
        self.media_backups.load(Ordering::SeqCst)
    }

    fn is_backfill_enabled(&self) -> bool {
        self.backfill_enabled.load(Ordering::SeqCst)
    }

    fn notify_low_disk_space(&self, bytes_needed: u64) {
        self.low_disk.lock().unwrap().push(bytes_needed);
    }

    fn notify_download_failed(&self, message_id: &MessageId) {
        self.failed.lock().unwrap().push(message_id.clone());
    }
}

pub(crate) struct FakeDisk {
    free: AtomicU64,
    fail: AtomicBool,
}

impl Default for FakeDisk {
    fn default() -> Self {
        Self {
            free: AtomicU64::new(u64::MAX),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeDisk {
    pub(crate) fn set_free(&self, bytes: u64) {
        self.free.store(bytes, Ordering::SeqCst);
    }

    pub(crate) fn fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiskSpaceProbe for FakeDisk {
    async fn free_bytes(&self) -> std::io::Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("statfs failed"));
        }
        Ok(self.free.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub(crate) struct FakeBackfillTransport {
    sent: Mutex<Vec<BackfillRequest>>,
    fail: AtomicBool,
}

impl FakeBackfillTransport {
    pub(crate) fn sent(&self) -> Vec<BackfillRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn fail_sends(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackfillTransport for FakeBackfillTransport {
    async fn send(&self, request: &BackfillRequest) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::transient("linked device unreachable"));
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// In-memory store that remembers the attempt count of every claim.
#[derive(Default)]
pub(crate) struct RecordingStore {
    inner: InMemoryJobStore<AttachmentDownloadJob>,
    claims: Mutex<Vec<(JobId, u32)>>,
}

impl RecordingStore {
    pub(crate) fn attempts_of(&self, id: &JobId) -> Vec<u32> {
        self.claims
            .lock()
            .unwrap()
            .iter()
            .filter(|(claimed, _)| claimed == id)
            .map(|(_, attempts)| *attempts)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn snapshot(&self, id: &JobId) -> Option<JobRecord<AttachmentDownloadJob>> {
        self.inner.snapshot(id)
    }
}

#[async_trait]
impl JobStore<AttachmentDownloadJob, DownloadJobQuery> for RecordingStore {
    async fn mark_all_inactive(&self) -> Result<(), JobStoreError> {
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::mark_all_inactive(&self.inner).await
    }

    async fn insert(
        &self,
        records: Vec<JobRecord<AttachmentDownloadJob>>,
    ) -> Result<(), JobStoreError> {
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::insert(&self.inner, records).await
    }

    async fn update(&self, record: &JobRecord<AttachmentDownloadJob>) -> Result<(), JobStoreError> {
        if record.active {
            self.claims
                .lock()
                .unwrap()
                .push((record.id.clone(), record.attempts));
        }
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::update(&self.inner, record).await
    }

    async fn get(
        &self,
        id: &JobId,
    ) -> Result<Option<JobRecord<AttachmentDownloadJob>>, JobStoreError> {
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::get(&self.inner, id).await
    }

    async fn remove(&self, id: &JobId) -> Result<(), JobStoreError> {
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::remove(&self.inner, id).await
    }

    async fn jobs(&self) -> Result<Vec<JobRecord<AttachmentDownloadJob>>, JobStoreError> {
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::jobs(&self.inner).await
    }

    async fn next_jobs(
        &self,
        query: DownloadJobQuery,
    ) -> Result<Vec<JobRecord<AttachmentDownloadJob>>, JobStoreError> {
        self.inner.next_jobs(query).await
    }
}

/// Attachment with transport coordinates and a digest.
pub(crate) fn downloadable(digest: &str, size: u64) -> Attachment {
    Attachment {
        content_type: "image/png".to_string(),
        size,
        cdn_key: Some(format!("cdn-{digest}")),
        key: Some("key".to_string()),
        digest: Some(digest.to_string()),
        ..Default::default()
    }
}

pub(crate) fn message_with(id: &str, attachment: Attachment) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new("conversation"),
        author: Some(ServiceId::new("author")),
        sent_at: 1_700_000_000_000,
        received_at: 1_700_000_000_500,
        attachments: vec![MessageAttachment {
            attachment_type: AttachmentType::Attachment,
            attachment,
        }],
    }
}

/// Message whose only attachment lost its transport coordinates.
pub(crate) fn undownloadable_message(id: &str) -> Message {
    let attachment = Attachment {
        content_type: "image/png".to_string(),
        size: 1_000,
        digest: Some(format!("digest-{id}")),
        error: true,
        ..Default::default()
    };
    message_with(id, attachment)
}

pub(crate) fn zero_backoff(retry: RetryConfig) -> RetryConfig {
    retry.with_backoff(BackoffConfig {
        multiplier: 1.0,
        first_backoffs: vec![Duration::ZERO],
        max_backoff: Duration::ZERO,
    })
}

pub(crate) struct Harness {
    pub manager: AttachmentDownloadManager<Arc<RecordingStore>>,
    pub store: Arc<RecordingStore>,
    pub messages: Arc<FakeMessages>,
    pub transport: Arc<FakeTransport>,
    pub host: Arc<FakeHost>,
    pub disk: Arc<FakeDisk>,
    pub backfill: Arc<FakeBackfillTransport>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Fast timers and zero backoff, adjusted by `tweak`.
    pub(crate) fn with_config(tweak: impl FnOnce(DownloadConfig) -> DownloadConfig) -> Self {
        mediasync_observability::init();

        let jobs = JobManagerConfig::default()
            .with_name("test-downloads")
            .with_tick_interval(Duration::from_millis(20))
            .with_batch(BatchConfig {
                wait: Duration::from_millis(5),
                max_size: 100,
            });
        let config = DownloadConfig::default()
            .with_jobs(jobs)
            .with_progress_interval(Duration::from_millis(10))
            .with_standard_retry(zero_backoff(RetryConfig::default()))
            .with_backup_retry(zero_backoff(RetryConfig::unlimited()));

        let store = Arc::new(RecordingStore::default());
        let messages = Arc::new(FakeMessages::default());
        let transport = Arc::new(FakeTransport::default());
        let host = Arc::new(FakeHost::default());
        let disk = Arc::new(FakeDisk::default());
        let backfill = Arc::new(FakeBackfillTransport::default());

        let capabilities = Capabilities {
            transport: transport.clone(),
            messages: messages.clone(),
            disk: disk.clone(),
            host: host.clone(),
            backfill: backfill.clone(),
        };
        let manager = AttachmentDownloadManager::new(tweak(config), capabilities, store.clone());

        Self {
            manager,
            store,
            messages,
            transport,
            host,
            disk,
            backfill,
        }
    }

    /// Store `message` and build a request for its first attachment.
    pub(crate) fn request_for(&self, message: &Message) -> NewAttachmentDownload {
        self.messages.put(message.clone());
        let entry = &message.attachments[0];
        NewAttachmentDownload {
            attachment: entry.attachment.clone(),
            attachment_type: entry.attachment_type,
            is_manual_download: false,
            message_id: message.id.clone(),
            received_at: message.received_at,
            sent_at: message.sent_at,
            source: DownloadSource::Standard,
            urgency: DownloadUrgency::Standard,
        }
    }

    pub(crate) fn job_id(request: &NewAttachmentDownload) -> JobId {
        AttachmentDownloadJob::from_request(request).unwrap().job_id()
    }
}
