//! Backfill: asking a linked device to re-upload attachments that no
//! normal path can deliver any more.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mediasync_core::{
    Attachment, AttachmentSlot, AttachmentTransition, AttachmentType, ConversationId, DownloadSource, Message,
    MessageId, RemoteLocation, ServiceId,
};

use crate::capabilities::{
    BackfillTransport, HostEnvironment, MessageRepository, RepositoryError, TransportError,
};
use crate::job::{DownloadUrgency, NewAttachmentDownload};

/// Outbound request to the device that owns the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub author: Option<ServiceId>,
    pub attachments: Vec<AttachmentSlot>,
    /// Echoed back in the response.
    pub correlation_id: Uuid,
}

/// Inbound response from the linked device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillResponse {
    pub message_id: MessageId,
    pub correlation_id: Uuid,
    pub outcome: BackfillOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillOutcome {
    /// The linked device no longer has the message.
    MessageNotFound,
    Attachments(Vec<BackfillAttachmentResult>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillAttachmentResult {
    pub slot: AttachmentSlot,
    pub status: BackfillStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillStatus {
    /// Re-uploaded; download from the new location.
    Available(RemoteLocation),
    TerminalError,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackfillError {
    #[error("failed to send backfill request: {0}")]
    Send(#[from] TransportError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone)]
struct PendingBackfill {
    correlation_id: Uuid,
    attachments: Vec<AttachmentSlot>,
}

/// Tracks in-flight backfill requests, one per message.
pub struct BackfillCoordinator {
    messages: Arc<dyn MessageRepository>,
    transport: Arc<dyn BackfillTransport>,
    host: Arc<dyn HostEnvironment>,
    pending: Mutex<HashMap<MessageId, PendingBackfill>>,
}

impl BackfillCoordinator {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        transport: Arc<dyn BackfillTransport>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        Self {
            messages,
            transport,
            host,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageId, PendingBackfill>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Backfill applies to body attachments, long text and link previews.
    pub fn is_enabled_for(&self, attachment_type: AttachmentType) -> bool {
        self.host.is_backfill_enabled()
            && matches!(
                attachment_type,
                AttachmentType::Attachment | AttachmentType::LongMessage | AttachmentType::Preview
            )
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.lock().contains_key(message_id)
    }

    /// Ask the owning device for every unreachable, eligible attachment on
    /// `message`. Replaces any earlier request for the same message.
    ///
    /// Returns the correlation id, or `None` when nothing was eligible. On
    /// error the attachments are left marked as failed backfills.
    pub async fn request(&self, message: &Message) -> Result<Option<Uuid>, BackfillError> {
        let eligible: Vec<_> = message
            .attachments
            .iter()
            .filter(|entry| {
                self.is_enabled_for(entry.attachment_type)
                    && entry.attachment.is_permanently_undownloadable()
            })
            .filter_map(|entry| entry.slot().map(|slot| (slot, entry.attachment.clone())))
            .collect();

        if eligible.is_empty() {
            debug!(message_id = %message.id, "no attachments eligible for backfill");
            return Ok(None);
        }

        let correlation_id = Uuid::now_v7();
        let slots: Vec<_> = eligible.iter().map(|(slot, _)| slot.clone()).collect();
        let superseded = self.lock().insert(
            message.id.clone(),
            PendingBackfill {
                correlation_id,
                attachments: slots.clone(),
            },
        );
        if superseded.is_some() {
            info!(message_id = %message.id, "superseding pending backfill request");
        }

        let request = BackfillRequest {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            author: message.author.clone(),
            attachments: slots,
            correlation_id,
        };

        if let Err(err) = self.mark_and_send(&eligible, &request).await {
            self.forget(&message.id, correlation_id);
            warn!(message_id = %message.id, error = %err, "failed to request backfill");
            for (slot, attachment) in &eligible {
                let failed = attachment.transition(AttachmentTransition::BackfillFailed);
                if let Err(save_err) = self.messages.save_attachment(&message.id, slot, failed).await {
                    warn!(message_id = %message.id, error = %save_err, "failed to mark backfill as failed");
                }
            }
            return Err(err);
        }

        info!(
            message_id = %message.id,
            attachments = request.attachments.len(),
            %correlation_id,
            "requested backfill"
        );
        Ok(Some(correlation_id))
    }

    async fn mark_and_send(
        &self,
        eligible: &[(AttachmentSlot, Attachment)],
        request: &BackfillRequest,
    ) -> Result<(), BackfillError> {
        for (slot, attachment) in eligible {
            let next = attachment.transition(AttachmentTransition::BackfillRequested);
            self.messages
                .save_attachment(&request.message_id, slot, next)
                .await?;
        }
        self.transport.send(request).await?;
        Ok(())
    }

    /// Drop the pending entry for `message_id` if it still belongs to
    /// `correlation_id`. Returns the dropped entry.
    fn forget(&self, message_id: &MessageId, correlation_id: Uuid) -> Option<PendingBackfill> {
        let mut pending = self.lock();
        if pending
            .get(message_id)
            .is_some_and(|entry| entry.correlation_id == correlation_id)
        {
            pending.remove(message_id)
        } else {
            None
        }
    }

    /// Apply a response and close its request. Returns downloads to enqueue
    /// for attachments the device re-uploaded.
    ///
    /// Requested attachments the response does not deliver are marked as
    /// failed backfills. A failed write skips that attachment only.
    pub async fn handle_response(
        &self,
        response: BackfillResponse,
    ) -> Result<Vec<NewAttachmentDownload>, BackfillError> {
        match self.lock().get(&response.message_id) {
            None => {
                info!(message_id = %response.message_id, "no pending backfill request, ignoring response");
                return Ok(Vec::new());
            }
            Some(entry) if entry.correlation_id != response.correlation_id => {
                warn!(message_id = %response.message_id, "stale backfill response, ignoring");
                return Ok(Vec::new());
            }
            Some(_) => {}
        }

        let message = self.messages.message(&response.message_id).await?;
        let Some(pending) = self.forget(&response.message_id, response.correlation_id) else {
            debug!(message_id = %response.message_id, "backfill request superseded while reading message");
            return Ok(Vec::new());
        };
        let Some(message) = message else {
            info!(message_id = %response.message_id, "message deleted before backfill response");
            return Ok(Vec::new());
        };

        let mut delivered: HashMap<AttachmentSlot, RemoteLocation> = HashMap::new();
        match response.outcome {
            BackfillOutcome::MessageNotFound => {
                warn!(message_id = %message.id, "linked device does not have the message");
            }
            BackfillOutcome::Attachments(results) => {
                for result in results {
                    if !pending.attachments.contains(&result.slot) {
                        debug!(message_id = %message.id, "backfill result for an attachment that was not requested");
                        continue;
                    }
                    if let BackfillStatus::Available(location) = result.status {
                        delivered.insert(result.slot, location);
                    }
                }
            }
        }

        let mut downloads = Vec::new();
        for slot in &pending.attachments {
            let Some(current) = message.attachment(slot) else {
                continue;
            };

            let Some(location) = delivered.remove(slot) else {
                let failed = current.transition(AttachmentTransition::BackfillFailed);
                if let Err(err) = self.messages.save_attachment(&message.id, slot, failed).await {
                    warn!(message_id = %message.id, error = %err, "failed to mark backfill as failed");
                }
                continue;
            };

            let next = current.transition(AttachmentTransition::BackfillDelivered(location));
            if let Err(err) = self
                .messages
                .save_attachment(&message.id, slot, next.clone())
                .await
            {
                warn!(message_id = %message.id, error = %err, "failed to save backfilled attachment");
                continue;
            }
            downloads.push(NewAttachmentDownload {
                attachment: next,
                attachment_type: slot.attachment_type,
                is_manual_download: true,
                message_id: message.id.clone(),
                received_at: message.received_at,
                sent_at: message.sent_at,
                source: DownloadSource::Backfill,
                urgency: DownloadUrgency::Immediate,
            });
        }

        info!(
            message_id = %message.id,
            delivered = downloads.len(),
            requested = pending.attachments.len(),
            "handled backfill response"
        );
        Ok(downloads)
    }
}
