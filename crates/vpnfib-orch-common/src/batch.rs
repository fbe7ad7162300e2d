//! Bounded batching queue.
//!
//! Mutations are pushed through a bounded channel into a [`Consumer`],
//! coalescing unless configured otherwise; a background task hands them to a [`BatchHandler`] when a
//! full batch has accumulated, when the flush interval elapses, or on an
//! explicit [`BatchingQueue::flush`].

use crate::consumer::{Consumer, ConsumerConfig, KeyedMutation};
use async_trait::async_trait;
use log::{debug, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batching queue {0} is closed")]
    Closed(String),
}

/// Receives drained batches. Entries of one key arrive in order.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    async fn process_batch(&self, batch: Vec<KeyedMutation<T>>);
}

#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Bound of the intake channel; pushes wait when it is full.
    pub capacity: usize,
    /// Merge pending mutations of one key as the [`Consumer`] does.
    pub coalesce: bool,
}

impl BatchingConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: 1000,
            flush_interval: Duration::from_millis(500),
            capacity: 10_000,
            coalesce: true,
        }
    }

    /// Delivers every pushed mutation, in push order per key.
    pub fn without_coalescing(mut self) -> Self {
        self.coalesce = false;
        self
    }
}

enum Message<T> {
    Mutation(KeyedMutation<T>),
    Flush(oneshot::Sender<()>),
}

/// Handle to a running batching queue. Dropping every handle drains what
/// is left and stops the background task.
pub struct BatchingQueue<T> {
    name: String,
    tx: mpsc::Sender<Message<T>>,
    batches: Arc<AtomicU64>,
}

impl<T: Send + 'static> BatchingQueue<T> {
    /// Starts the background task. Must be called from within a tokio runtime.
    pub fn spawn(config: BatchingConfig, handler: Arc<dyn BatchHandler<T>>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let batches = Arc::new(AtomicU64::new(0));
        let name = config.name.clone();
        tokio::spawn(run(config, rx, handler, batches.clone()));
        Self { name, tx, batches }
    }

    pub async fn push(&self, mutation: KeyedMutation<T>) -> Result<(), BatchError> {
        self.tx
            .send(Message::Mutation(mutation))
            .await
            .map_err(|_| BatchError::Closed(self.name.clone()))
    }

    /// Hands everything pushed so far to the handler and waits until the
    /// handler has returned.
    pub async fn flush(&self) -> Result<(), BatchError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Message::Flush(ack))
            .await
            .map_err(|_| BatchError::Closed(self.name.clone()))?;
        done.await.map_err(|_| BatchError::Closed(self.name.clone()))
    }

    /// Batches delivered to the handler so far.
    pub fn batches_processed(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

async fn run<T: Send + 'static>(
    config: BatchingConfig,
    mut rx: mpsc::Receiver<Message<T>>,
    handler: Arc<dyn BatchHandler<T>>,
    batches: Arc<AtomicU64>,
) {
    let mut consumer_config =
        ConsumerConfig::new(config.name.clone()).with_batch_size(config.batch_size);
    if !config.coalesce {
        consumer_config = consumer_config.without_coalescing();
    }
    let mut pending = Consumer::new(consumer_config);
    let mut ticker = tokio::time::interval(config.flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Mutation(mutation)) => {
                    pending.add_to_sync([mutation]);
                    if pending.pending_count() >= config.batch_size {
                        drain(&config.name, &mut pending, handler.as_ref(), &batches).await;
                    }
                }
                Some(Message::Flush(ack)) => {
                    drain(&config.name, &mut pending, handler.as_ref(), &batches).await;
                    let _ = ack.send(());
                }
                None => {
                    drain(&config.name, &mut pending, handler.as_ref(), &batches).await;
                    debug!("BatchingQueue {}: intake closed, stopping", config.name);
                    return;
                }
            },
            _ = ticker.tick() => {
                drain(&config.name, &mut pending, handler.as_ref(), &batches).await;
            }
        }
    }
}

async fn drain<T>(
    name: &str,
    pending: &mut Consumer<T>,
    handler: &dyn BatchHandler<T>,
    batches: &AtomicU64,
) {
    while pending.has_pending() {
        let batch = pending.drain_batch();
        trace!("BatchingQueue {}: delivering {} mutations", name, batch.len());
        handler.process_batch(batch).await;
        batches.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        seen: parking_lot::Mutex<Vec<Vec<(String, u32)>>>,
    }

    #[async_trait]
    impl BatchHandler<u32> for Recorder {
        async fn process_batch(&self, batch: Vec<KeyedMutation<u32>>) {
            self.seen
                .lock()
                .push(batch.into_iter().map(|m| (m.key, m.payload)).collect());
        }
    }

    fn config(batch_size: usize) -> BatchingConfig {
        BatchingConfig {
            name: "test".to_string(),
            batch_size,
            flush_interval: Duration::from_secs(3600),
            capacity: 16,
            coalesce: true,
        }
    }

    #[tokio::test]
    async fn test_flush_delivers_coalesced_mutations() {
        let recorder = Arc::new(Recorder::default());
        let queue = BatchingQueue::spawn(config(100), recorder.clone());

        queue.push(KeyedMutation::set("a", 1)).await.unwrap();
        queue.push(KeyedMutation::set("a", 2)).await.unwrap();
        queue.push(KeyedMutation::set("b", 3)).await.unwrap();
        queue.flush().await.unwrap();

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, vec![vec![("a".to_string(), 2), ("b".to_string(), 3)]]);
        assert_eq!(queue.batches_processed(), 1);
    }

    #[tokio::test]
    async fn test_without_coalescing_delivers_every_mutation() {
        let recorder = Arc::new(Recorder::default());
        let queue = BatchingQueue::spawn(config(100).without_coalescing(), recorder.clone());

        queue.push(KeyedMutation::set("a", 1)).await.unwrap();
        queue.push(KeyedMutation::set("a", 2)).await.unwrap();
        queue.push(KeyedMutation::del("a", 3)).await.unwrap();
        queue.flush().await.unwrap();

        let seen = recorder.seen.lock().clone();
        assert_eq!(
            seen,
            vec![vec![
                ("a".to_string(), 1),
                ("a".to_string(), 2),
                ("a".to_string(), 3)
            ]]
        );
    }

    #[tokio::test]
    async fn test_full_batch_is_delivered_without_flush() {
        let recorder = Arc::new(Recorder::default());
        let queue = BatchingQueue::spawn(config(2), recorder.clone());

        queue.push(KeyedMutation::set("a", 1)).await.unwrap();
        queue.push(KeyedMutation::set("b", 2)).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_interval_flush() {
        let recorder = Arc::new(Recorder::default());
        let mut cfg = config(100);
        cfg.flush_interval = Duration::from_millis(5);
        let queue = BatchingQueue::spawn(cfg, recorder.clone());

        queue.push(KeyedMutation::set("a", 1)).await.unwrap();
        for _ in 0..200 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.seen.lock().len(), 1);
    }
}
