//! Throttled download progress written back onto the attachment record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use mediasync_core::{Attachment, AttachmentSlot, AttachmentTransition, MessageId};

use crate::capabilities::MessageRepository;

/// Handed to the transport; reports cumulative bytes received.
///
/// Reports are coalesced: only the latest value is written.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<u64>>,
}

impl ProgressReporter {
    pub fn report(&self, total_bytes: u64) {
        self.tx.send_replace(total_bytes);
    }
}

/// Background writer for one download's progress.
pub(crate) struct ProgressWriter {
    done: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct ProgressTarget {
    pub messages: Arc<dyn MessageRepository>,
    pub message_id: MessageId,
    pub slot: AttachmentSlot,
    pub attachment: Attachment,
}

impl ProgressWriter {
    /// At most one write per `interval`; stops when the download is
    /// cancelled or the writer is finished.
    pub(crate) fn spawn(
        target: ProgressTarget,
        interval: Duration,
        cancellation: CancellationToken,
    ) -> (ProgressReporter, Self) {
        let (tx, mut rx) = watch::channel(0u64);
        let done = CancellationToken::new();
        let stop = done.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = cancellation.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let total = *rx.borrow_and_update();
                let next = target
                    .attachment
                    .transition(AttachmentTransition::Progress { total_downloaded: total });
                if let Err(err) = target
                    .messages
                    .save_attachment(&target.message_id, &target.slot, next)
                    .await
                {
                    warn!(message_id = %target.message_id, error = %err, "failed to save download progress");
                }

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        (ProgressReporter { tx: Arc::new(tx) }, Self { done, handle })
    }

    /// Stop writing and wait for any in-flight write to land.
    pub(crate) async fn finish(self) {
        self.done.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "progress writer failed");
        }
    }
}
