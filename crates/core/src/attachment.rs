//! Attachment record and its state transitions.
//!
//! The record persisted on the owning message is the single source of truth
//! the UI renders from (spinner, retry button, "too large", backfill in
//! progress). Every change goes through [`Attachment::transition`], so the
//! set of legal changes is the [`AttachmentTransition`] enum and nothing else.

use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// Content type recorded for thumbnails fetched from the remote backup.
pub const BACKUP_THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Which slot of a message an attachment occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentType {
    LongMessage,
    Attachment,
    Preview,
    Contact,
    Quote,
    Sticker,
}

impl AttachmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentType::LongMessage => "long-message",
            AttachmentType::Attachment => "attachment",
            AttachmentType::Preview => "preview",
            AttachmentType::Contact => "contact",
            AttachmentType::Quote => "quote",
            AttachmentType::Sticker => "sticker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "long-message" => Some(AttachmentType::LongMessage),
            "attachment" => Some(AttachmentType::Attachment),
            "preview" => Some(AttachmentType::Preview),
            "contact" => Some(AttachmentType::Contact),
            "quote" => Some(AttachmentType::Quote),
            "sticker" => Some(AttachmentType::Sticker),
            _ => None,
        }
    }
}

impl core::fmt::Display for AttachmentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a download request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSource {
    /// User-initiated or regular sync download.
    Standard,
    /// Media restored from the remote backup after a backup import.
    BackupImport,
    /// Re-fetch of an attachment a linked device re-uploaded for us.
    Backfill,
}

impl DownloadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadSource::Standard => "standard",
            DownloadSource::BackupImport => "backup_import",
            DownloadSource::Backfill => "backfill",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(DownloadSource::Standard),
            "backup_import" => Some(DownloadSource::BackupImport),
            "backfill" => Some(DownloadSource::Backfill),
            _ => None,
        }
    }
}

/// Small preview replica fetched from the remote backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupThumbnail {
    pub content_type: String,
    pub path: String,
    pub size: u64,
}

/// Result of a successful transfer: a reference to the stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedContent {
    pub path: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub plaintext_hash: Option<String>,
}

/// Fresh transport coordinates delivered by a backfill response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub cdn_key: String,
    pub key: String,
    pub digest: Option<String>,
    pub size: Option<u64>,
}

/// An attachment as persisted on its owning message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    /// Declared plaintext size in bytes.
    pub size: u64,
    pub file_name: Option<String>,
    pub cdn_key: Option<String>,
    pub key: Option<String>,
    pub digest: Option<String>,
    pub plaintext_hash: Option<String>,
    /// Media name in the remote backup, if the attachment was backed up.
    pub backup_locator: Option<String>,
    pub imported_from_local_backup: bool,
    /// Local content reference once downloaded.
    pub path: Option<String>,
    pub pending: bool,
    pub error: bool,
    pub was_too_big: bool,
    pub backfill_error: bool,
    pub total_downloaded: Option<u64>,
    pub thumbnail_from_backup: Option<BackupThumbnail>,
}

impl ValueObject for Attachment {}

/// Reason for a change to an attachment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentTransition {
    /// The full-size transfer is about to start.
    DownloadStarted,
    /// Bytes received so far; capped at the declared size.
    Progress { total_downloaded: u64 },
    /// The attempt stopped (cancelled or will be retried); clear the spinner.
    DownloadInterrupted,
    /// The full-size content is stored locally.
    Downloaded(DownloadedContent),
    BackupThumbnailFetched(BackupThumbnail),
    /// Declared size exceeds the configured maximum. Terminal.
    TooBig,
    /// Unreachable by any normal path. Terminal.
    PermanentlyErrored { backfill_error: bool },
    /// Attempts exhausted; the user may retry by hand.
    TransientlyErrored,
    /// A linked device was asked to re-upload this attachment.
    BackfillRequested,
    /// The linked device re-uploaded it; download can start again.
    BackfillDelivered(RemoteLocation),
    /// The linked device could not help.
    BackfillFailed,
}

impl Attachment {
    /// Stable signature of the not-yet-downloaded attachment.
    ///
    /// Built from immutable crypto fields so it survives every transition.
    pub fn undownloaded_signature(&self) -> Option<String> {
        match (&self.digest, &self.plaintext_hash) {
            (Some(digest), Some(hash)) => Some(format!("{digest}.{hash}")),
            (Some(digest), None) => Some(digest.clone()),
            (None, Some(hash)) => Some(hash.clone()),
            (None, None) => None,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.path.is_some()
    }

    /// Whether any normal (non-backfill) path can fetch the content.
    pub fn is_downloadable(&self) -> bool {
        self.key.is_some() && (self.cdn_key.is_some() || self.backup_locator.is_some())
    }

    /// Undownloadable by normal means, but a linked device might still help.
    pub fn is_permanently_undownloadable(&self) -> bool {
        !self.is_downloaded() && !self.is_downloadable() && !self.was_too_big
    }

    /// Already failed and only a backfill can recover it.
    pub fn is_permanently_undownloadable_without_backfill(&self) -> bool {
        if self.is_downloadable() || !self.error {
            return false;
        }
        !self.was_too_big
    }

    pub fn can_have_thumbnail(&self) -> bool {
        self.content_type.starts_with("image/") || self.content_type.starts_with("video/")
    }

    /// Whether the content is expected to be replicated to the remote backup.
    pub fn should_end_up_in_remote_backup(&self, has_media_backups: bool) -> bool {
        has_media_backups && self.key.is_some() && self.plaintext_hash.is_some()
    }

    /// Produce the next record from this one.
    pub fn transition(&self, transition: AttachmentTransition) -> Attachment {
        let mut next = self.clone();
        match transition {
            AttachmentTransition::DownloadStarted => {
                next.pending = true;
            }
            AttachmentTransition::Progress { total_downloaded } => {
                next.pending = true;
                next.total_downloaded = Some(total_downloaded.min(self.size));
            }
            AttachmentTransition::DownloadInterrupted => {
                next.pending = false;
            }
            AttachmentTransition::Downloaded(content) => {
                next.path = Some(content.path);
                if let Some(content_type) = content.content_type {
                    next.content_type = content_type;
                }
                if next.plaintext_hash.is_none() {
                    next.plaintext_hash = content.plaintext_hash;
                }
                next.pending = false;
                next.error = false;
                next.backfill_error = false;
                next.total_downloaded = None;
            }
            AttachmentTransition::BackupThumbnailFetched(thumbnail) => {
                next.thumbnail_from_backup = Some(thumbnail);
                next.pending = false;
            }
            AttachmentTransition::TooBig => {
                next = self.transition(AttachmentTransition::PermanentlyErrored {
                    backfill_error: false,
                });
                next.was_too_big = true;
            }
            AttachmentTransition::PermanentlyErrored { backfill_error } => {
                next.cdn_key = None;
                next.pending = false;
                next.error = true;
                next.backfill_error = backfill_error;
                next.total_downloaded = None;
            }
            AttachmentTransition::TransientlyErrored => {
                next.pending = false;
                next.error = true;
            }
            AttachmentTransition::BackfillRequested => {
                next.pending = true;
                next.error = false;
                next.backfill_error = false;
            }
            AttachmentTransition::BackfillDelivered(location) => {
                next.cdn_key = Some(location.cdn_key);
                next.key = Some(location.key);
                if location.digest.is_some() {
                    next.digest = location.digest;
                }
                if let Some(size) = location.size {
                    next.size = size;
                }
                next.error = false;
                next.backfill_error = false;
                next.pending = true;
            }
            AttachmentTransition::BackfillFailed => {
                next = self.transition(AttachmentTransition::PermanentlyErrored {
                    backfill_error: true,
                });
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_photo() -> Attachment {
        Attachment {
            content_type: "image/png".to_string(),
            size: 2_000,
            cdn_key: Some("cdn-1".to_string()),
            key: Some("key".to_string()),
            digest: Some("digest".to_string()),
            plaintext_hash: Some("hash".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn signature_is_stable_across_transitions() {
        let attachment = remote_photo();
        let before = attachment.undownloaded_signature();
        let after = attachment
            .transition(AttachmentTransition::DownloadStarted)
            .transition(AttachmentTransition::TransientlyErrored)
            .undownloaded_signature();
        assert_eq!(before, after);
        assert_eq!(before.as_deref(), Some("digest.hash"));
    }

    #[test]
    fn progress_is_capped_at_declared_size() {
        let next = remote_photo().transition(AttachmentTransition::Progress {
            total_downloaded: 9_999,
        });
        assert_eq!(next.total_downloaded, Some(2_000));
        assert!(next.pending);
    }

    #[test]
    fn downloaded_clears_transient_state() {
        let started = remote_photo().transition(AttachmentTransition::Progress {
            total_downloaded: 10,
        });
        let done = started.transition(AttachmentTransition::Downloaded(DownloadedContent {
            path: "ab/cdef".to_string(),
            size: 2_000,
            content_type: None,
            plaintext_hash: None,
        }));
        assert_eq!(done.path.as_deref(), Some("ab/cdef"));
        assert!(!done.pending);
        assert!(!done.error);
        assert_eq!(done.total_downloaded, None);
    }

    #[test]
    fn too_big_is_terminal_and_not_backfillable() {
        let next = remote_photo().transition(AttachmentTransition::TooBig);
        assert!(next.error);
        assert!(next.was_too_big);
        assert!(!next.pending);
        assert!(!next.is_permanently_undownloadable_without_backfill());
    }

    #[test]
    fn permanent_error_makes_attachment_backfillable() {
        let next = remote_photo().transition(AttachmentTransition::PermanentlyErrored {
            backfill_error: false,
        });
        assert!(!next.is_downloadable());
        assert!(next.is_permanently_undownloadable_without_backfill());
    }

    #[test]
    fn backfill_delivery_restores_downloadability() {
        let failed = remote_photo().transition(AttachmentTransition::PermanentlyErrored {
            backfill_error: false,
        });
        let delivered = failed.transition(AttachmentTransition::BackfillDelivered(RemoteLocation {
            cdn_key: "cdn-2".to_string(),
            key: "key-2".to_string(),
            digest: None,
            size: None,
        }));
        assert!(delivered.is_downloadable());
        assert!(!delivered.error);
        assert_eq!(delivered.digest.as_deref(), Some("digest"));
    }

    #[test]
    fn backfill_failure_is_flagged() {
        let next = remote_photo()
            .transition(AttachmentTransition::BackfillRequested)
            .transition(AttachmentTransition::BackfillFailed);
        assert!(next.error);
        assert!(next.backfill_error);
        assert!(!next.pending);
    }

    #[test]
    fn thumbnails_only_for_visual_media() {
        let mut attachment = remote_photo();
        assert!(attachment.can_have_thumbnail());
        attachment.content_type = "application/pdf".to_string();
        assert!(!attachment.can_have_thumbnail());
    }

    #[test]
    fn remote_backup_requires_media_backups_and_hash() {
        let attachment = remote_photo();
        assert!(attachment.should_end_up_in_remote_backup(true));
        assert!(!attachment.should_end_up_in_remote_backup(false));
        let no_hash = Attachment {
            plaintext_hash: None,
            ..remote_photo()
        };
        assert!(!no_hash.should_end_up_in_remote_backup(true));
    }
}
