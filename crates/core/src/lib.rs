//! `mediasync-core` — attachment domain building blocks.
//!
//! This crate contains **pure domain** primitives (no scheduling, no IO):
//! identifiers, the attachment record and its legal state transitions, the
//! owning message model, and encrypted-size arithmetic.

pub mod attachment;
pub mod error;
pub mod id;
pub mod message;
pub mod size;
pub mod value_object;

pub use attachment::{
    Attachment, AttachmentTransition, AttachmentType, BackupThumbnail, DownloadSource,
    DownloadedContent, RemoteLocation,
};
pub use error::{DomainError, DomainResult};
pub use id::{ConversationId, MessageId, ServiceId};
pub use message::{AttachmentSlot, Message, MessageAttachment};
pub use size::{KIBIBYTE, ciphertext_length};
pub use value_object::ValueObject;
