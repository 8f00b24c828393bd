//! Write batching for deferred database work.
//!
//! A generic batch writer that buffers items and flushes them periodically or
//! when the buffer reaches a certain size. The lifecycle orchestrator uses it
//! to run task-queue cleanup after the triggering transaction has committed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Maximum number of items to buffer before flushing.
    pub max_buffer_size: usize,
    /// Maximum time to wait before flushing.
    pub flush_interval: Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            flush_interval: Duration::from_secs(2),
        }
    }
}

/// A generic batch writer that buffers items and flushes them periodically.
pub struct BatchWriter<T> {
    sender: mpsc::Sender<T>,
    handle: tokio::task::JoinHandle<()>,
}

impl<T: Send + 'static> BatchWriter<T> {
    /// Create a new batch writer with the given configuration and flush function.
    pub fn new<F, Fut>(config: BatchWriterConfig, flush_fn: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), crate::Error>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<T>(config.max_buffer_size.max(1) * 2);
        let flush_fn = Arc::new(flush_fn);

        let handle = tokio::spawn(Self::run_flush_loop(receiver, config, flush_fn));

        Self { sender, handle }
    }

    /// Add an item to the batch.
    pub async fn add(&self, item: T) -> Result<(), crate::Error> {
        self.sender
            .send(item)
            .await
            .map_err(|_| crate::Error::Other("Batch writer channel closed".to_string()))
    }

    /// Close the channel and wait for the remaining items to be flushed.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            tracing::error!("Batch writer task failed: {}", e);
        }
    }

    async fn run_flush_loop<F, Fut>(
        mut receiver: mpsc::Receiver<T>,
        config: BatchWriterConfig,
        flush_fn: Arc<F>,
    ) where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), crate::Error>> + Send + 'static,
    {
        let mut buffer = Vec::with_capacity(config.max_buffer_size);
        let mut ticker = interval(config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    let Some(item) = received else {
                        flush(flush_fn.as_ref(), &mut buffer, "shutdown").await;
                        break;
                    };
                    buffer.push(item);
                    if buffer.len() >= config.max_buffer_size {
                        flush(flush_fn.as_ref(), &mut buffer, "size").await;
                    }
                }
                _ = ticker.tick() => flush(flush_fn.as_ref(), &mut buffer, "interval").await,
            }
        }
    }
}

/// Hand the buffered items to `flush_fn`. Failures are logged and the items
/// dropped; the next trigger starts from an empty buffer.
async fn flush<T, F, Fut>(flush_fn: &F, buffer: &mut Vec<T>, trigger: &'static str)
where
    F: Fn(Vec<T>) -> Fut,
    Fut: std::future::Future<Output = Result<(), crate::Error>>,
{
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let size = batch.len();
    match flush_fn(batch).await {
        Ok(()) => tracing::trace!(trigger, size, "Batch flushed"),
        Err(e) => tracing::error!(trigger, size, error = %e, "Batch flush failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_batch_writer_flush_on_size() {
        let flush_count = Arc::new(AtomicUsize::new(0));
        let flush_count_clone = flush_count.clone();

        let config = BatchWriterConfig {
            max_buffer_size: 3,
            flush_interval: Duration::from_secs(60),
        };

        let writer = BatchWriter::new(config, move |items: Vec<i64>| {
            let count = flush_count_clone.clone();
            async move {
                count.fetch_add(items.len(), Ordering::SeqCst);
                Ok(())
            }
        });

        writer.add(1).await.unwrap();
        writer.add(2).await.unwrap();
        writer.add(3).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(flush_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_items() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let flushed_clone = flushed.clone();

        let writer = BatchWriter::new(
            BatchWriterConfig {
                max_buffer_size: 100,
                flush_interval: Duration::from_secs(60),
            },
            move |items: Vec<i64>| {
                let flushed = flushed_clone.clone();
                async move {
                    flushed.fetch_add(items.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        writer.add(10).await.unwrap();
        writer.add(11).await.unwrap();
        writer.shutdown().await;

        assert_eq!(flushed.load(Ordering::SeqCst), 2);
    }
}
