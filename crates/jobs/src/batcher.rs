//! Coalesces bursts of inserts into batched writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::BatchConfig;

/// Destination of a flushed batch.
#[async_trait]
pub trait BatchSink<T>: Send + Sync + 'static
where
    T: Sync,
{
    async fn write_batch(&self, items: &[T]) -> anyhow::Result<()>;
}

/// Buffers items and writes them after `wait`, or as soon as `max_size`
/// items are pending. A failed write is put back and retried after the
/// next `wait`.
pub struct Batcher<T, K> {
    inner: Arc<BatcherInner<T, K>>,
}

struct BatcherInner<T, K> {
    config: BatchConfig,
    sink: K,
    pending: Mutex<Vec<T>>,
    timer_armed: AtomicBool,
    // Held for the whole take-and-write, so a flush that returns has seen
    // every item added before it started.
    write_lock: tokio::sync::Mutex<()>,
}

impl<T, K> Batcher<T, K>
where
    T: Send + Sync + 'static,
    K: BatchSink<T>,
{
    pub fn new(config: BatchConfig, sink: K) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                sink,
                pending: Mutex::new(Vec::new()),
                timer_armed: AtomicBool::new(false),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Queue an item. Must be called from within a tokio runtime.
    pub fn add(&self, item: T) {
        let len = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.push(item);
            pending.len()
        };

        if len >= self.inner.config.max_size {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.flush().await });
        } else {
            self.inner.arm_timer();
        }
    }

    /// Write everything queued so far and wait for the write to finish.
    pub async fn flush_and_wait(&self) {
        self.inner.flush().await;
    }

    pub fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T, K> BatcherInner<T, K>
where
    T: Send + Sync + 'static,
    K: BatchSink<T>,
{
    fn arm_timer(self: &Arc<Self>) {
        if self.timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.wait).await;
            inner.flush().await;
        });
    }

    async fn flush(self: &Arc<Self>) {
        let _guard = self.write_lock.lock().await;
        self.timer_armed.store(false, Ordering::Release);

        let items = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if items.is_empty() {
            return;
        }

        let count = items.len();
        match self.sink.write_batch(&items).await {
            Ok(()) => debug!(count, "flushed batch"),
            Err(err) => {
                error!(count, error = %err, "failed to write batch, retrying later");
                {
                    let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                    let newer = std::mem::replace(&mut *pending, items);
                    pending.extend(newer);
                }
                self.arm_timer();
            }
        }
    }
}
