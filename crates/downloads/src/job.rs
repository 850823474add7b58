//! Attachment download job payload, identity and store query.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mediasync_core::{
    Attachment, AttachmentSlot, AttachmentType, DomainError, DomainResult, DownloadSource,
    MessageId, ciphertext_length,
};
use mediasync_jobs::{JobId, JobRecord, JobSelector};

/// How soon the caller wants the download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadUrgency {
    /// Skip the backlog (the user is waiting for it).
    Immediate,
    #[default]
    Standard,
}

/// Enqueue request for one attachment slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachmentDownload {
    pub attachment: Attachment,
    pub attachment_type: AttachmentType,
    pub is_manual_download: bool,
    pub message_id: MessageId,
    pub received_at: i64,
    pub sent_at: i64,
    pub source: DownloadSource,
    pub urgency: DownloadUrgency,
}

/// Stored payload of an attachment download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDownloadJob {
    pub message_id: MessageId,
    pub attachment_type: AttachmentType,
    pub attachment_signature: String,
    pub attachment: Attachment,
    pub ciphertext_size: u64,
    pub content_type: String,
    pub is_manual_download: bool,
    pub source: DownloadSource,
    /// Source at enqueue time; `source` may be rewritten later.
    pub original_source: DownloadSource,
    pub received_at: i64,
    pub sent_at: i64,
    pub size: u64,
}

impl AttachmentDownloadJob {
    /// Build and validate a job from an enqueue request.
    pub fn from_request(request: &NewAttachmentDownload) -> DomainResult<Self> {
        if request.message_id.is_empty() {
            return Err(DomainError::validation("message id is required"));
        }
        let signature = request
            .attachment
            .undownloaded_signature()
            .ok_or(DomainError::MissingSignature)?;

        Ok(Self {
            message_id: request.message_id.clone(),
            attachment_type: request.attachment_type,
            attachment_signature: signature,
            attachment: request.attachment.clone(),
            ciphertext_size: ciphertext_length(request.attachment.size),
            content_type: request.attachment.content_type.clone(),
            is_manual_download: request.is_manual_download,
            source: request.source,
            original_source: request.source,
            received_at: request.received_at,
            sent_at: request.sent_at,
            size: request.attachment.size,
        })
    }

    /// One job per attachment slot on a message.
    pub fn job_id(&self) -> JobId {
        JobId::new(format!(
            "{}.{}.{}",
            self.message_id, self.attachment_type, self.attachment_signature
        ))
    }

    pub fn job_id_for_logging(&self) -> String {
        format!(
            "{}.{}.{}",
            self.sent_at,
            self.attachment_type,
            redact(&self.attachment_signature)
        )
    }

    pub fn slot(&self) -> AttachmentSlot {
        AttachmentSlot {
            attachment_type: self.attachment_type,
            signature: self.attachment_signature.clone(),
        }
    }
}

/// Keep only the last three characters of sensitive text.
fn redact(text: &str) -> String {
    let tail: String = {
        let chars: Vec<char> = text.chars().collect();
        chars[chars.len().saturating_sub(3)..].iter().collect()
    };
    format!("[REDACTED]{tail}")
}

/// "Next jobs" query: visible messages first, then newest first.
#[derive(Debug, Clone)]
pub struct DownloadJobQuery {
    pub limit: usize,
    pub now: DateTime<Utc>,
    pub prioritize: HashSet<MessageId>,
    /// `None` admits every source.
    pub sources: Option<Vec<DownloadSource>>,
}

impl DownloadJobQuery {
    pub fn admits(&self, source: DownloadSource) -> bool {
        self.sources
            .as_ref()
            .is_none_or(|sources| sources.contains(&source))
    }

    fn is_prioritized(&self, job: &AttachmentDownloadJob) -> bool {
        self.prioritize.contains(&job.message_id)
    }
}

impl JobSelector<AttachmentDownloadJob> for DownloadJobQuery {
    fn limit(&self) -> usize {
        self.limit
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn matches(&self, record: &JobRecord<AttachmentDownloadJob>) -> bool {
        self.admits(record.data.source)
    }

    fn compare(
        &self,
        a: &JobRecord<AttachmentDownloadJob>,
        b: &JobRecord<AttachmentDownloadJob>,
    ) -> Ordering {
        self.is_prioritized(&b.data)
            .cmp(&self.is_prioritized(&a.data))
            .then_with(|| b.data.received_at.cmp(&a.data.received_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediasync_jobs::{InMemoryJobStore, JobStore};

    fn request(message_id: &str, digest: Option<&str>) -> NewAttachmentDownload {
        NewAttachmentDownload {
            attachment: Attachment {
                content_type: "image/jpeg".to_string(),
                size: 1_000,
                digest: digest.map(str::to_string),
                ..Default::default()
            },
            attachment_type: AttachmentType::Attachment,
            is_manual_download: false,
            message_id: MessageId::new(message_id),
            received_at: 10,
            sent_at: 1_700_000_000_000,
            source: DownloadSource::Standard,
            urgency: DownloadUrgency::Standard,
        }
    }

    #[test]
    fn job_id_is_deterministic_per_slot() {
        let job = AttachmentDownloadJob::from_request(&request("m-1", Some("abcdef"))).unwrap();
        assert_eq!(job.job_id().as_str(), "m-1.attachment.abcdef");
        assert_eq!(job.ciphertext_size, ciphertext_length(1_000));
        assert_eq!(job.original_source, DownloadSource::Standard);

        let again = AttachmentDownloadJob::from_request(&request("m-1", Some("abcdef"))).unwrap();
        assert_eq!(job.job_id(), again.job_id());
    }

    #[test]
    fn logging_id_redacts_signature() {
        let job = AttachmentDownloadJob::from_request(&request("m-1", Some("abcdef"))).unwrap();
        let logged = job.job_id_for_logging();
        assert_eq!(logged, "1700000000000.attachment.[REDACTED]def");
        assert!(!logged.contains("abcdef"));
        assert!(!logged.contains("m-1"));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        assert!(AttachmentDownloadJob::from_request(&request("m-1", None)).is_err());
        assert!(AttachmentDownloadJob::from_request(&request("", Some("abc"))).is_err());
    }

    #[tokio::test]
    async fn query_prefers_visible_then_newest_and_filters_sources() {
        let store = InMemoryJobStore::new();
        let mut records = Vec::new();
        for (message, received_at, source) in [
            ("old-visible", 1, DownloadSource::Standard),
            ("new", 3, DownloadSource::Standard),
            ("newest-backup", 9, DownloadSource::BackupImport),
            ("mid", 2, DownloadSource::Backfill),
        ] {
            let mut req = request(message, Some("sig"));
            req.received_at = received_at;
            req.source = source;
            let job = AttachmentDownloadJob::from_request(&req).unwrap();
            records.push(JobRecord::new(job.job_id(), job));
        }
        JobStore::<AttachmentDownloadJob, DownloadJobQuery>::insert(&store, records)
            .await
            .unwrap();

        let query = DownloadJobQuery {
            limit: 10,
            now: Utc::now(),
            prioritize: HashSet::from([MessageId::new("old-visible")]),
            sources: Some(vec![DownloadSource::Standard, DownloadSource::Backfill]),
        };
        let next = store.next_jobs(query).await.unwrap();
        let order: Vec<_> = next.iter().map(|r| r.data.message_id.as_str()).collect();

        assert_eq!(order, vec!["old-visible", "new", "mid"]);
    }
}
