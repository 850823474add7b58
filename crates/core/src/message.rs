//! The message that owns attachments.

use serde::{Deserialize, Serialize};

use crate::attachment::{Attachment, AttachmentType};
use crate::id::{ConversationId, MessageId, ServiceId};

/// One attachment slot on a message together with its current record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub attachment_type: AttachmentType,
    pub attachment: Attachment,
}

/// Addresses an attachment slot without carrying the record itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentSlot {
    pub attachment_type: AttachmentType,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Sender of the message; `None` for messages authored on this device.
    pub author: Option<ServiceId>,
    /// Milliseconds since the Unix epoch.
    pub sent_at: i64,
    pub received_at: i64,
    pub attachments: Vec<MessageAttachment>,
}

impl Message {
    /// Find the attachment in `slot` by its undownloaded signature.
    pub fn attachment(&self, slot: &AttachmentSlot) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|entry| entry.matches(slot))
            .map(|entry| &entry.attachment)
    }

    /// Replace the attachment in `slot`. Returns `false` if no slot matched.
    pub fn replace_attachment(&mut self, slot: &AttachmentSlot, attachment: Attachment) -> bool {
        match self.attachments.iter_mut().find(|entry| entry.matches(slot)) {
            Some(entry) => {
                entry.attachment = attachment;
                true
            }
            None => false,
        }
    }
}

impl MessageAttachment {
    pub fn slot(&self) -> Option<AttachmentSlot> {
        self.attachment
            .undownloaded_signature()
            .map(|signature| AttachmentSlot {
                attachment_type: self.attachment_type,
                signature,
            })
    }

    fn matches(&self, slot: &AttachmentSlot) -> bool {
        self.attachment_type == slot.attachment_type
            && self.attachment.undownloaded_signature().as_deref() == Some(slot.signature.as_str())
    }
}
