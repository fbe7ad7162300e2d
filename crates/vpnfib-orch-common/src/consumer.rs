//! Keyed mutation queue with per-key coalescing.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;

/// Operation carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create or update.
    Set,
    Del,
}

impl Operation {
    pub fn is_set(&self) -> bool {
        matches!(self, Operation::Set)
    }

    pub fn is_del(&self) -> bool {
        matches!(self, Operation::Del)
    }
}

/// One queued mutation: a key, the operation and its payload.
///
/// DEL entries carry a payload too, since removing forwarding state needs
/// the content of the entry being removed.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedMutation<T> {
    pub key: String,
    pub op: Operation,
    pub payload: T,
}

impl<T> KeyedMutation<T> {
    pub fn set(key: impl Into<String>, payload: T) -> Self {
        Self {
            key: key.into(),
            op: Operation::Set,
            payload,
        }
    }

    pub fn del(key: impl Into<String>, payload: T) -> Self {
        Self {
            key: key.into(),
            op: Operation::Del,
            payload,
        }
    }
}

/// Configuration for a Consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    /// Maximum entries returned by one `drain_batch` call.
    pub batch_size: usize,
    /// When set, a DEL drops the pending SETs of its key and a SET replaces
    /// a pending SET. When clear, every mutation is kept in arrival order.
    pub coalesce: bool,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: 128,
            coalesce: true,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn without_coalescing(mut self) -> Self {
        self.coalesce = false;
        self
    }
}

/// Pending mutations indexed by key.
///
/// With coalescing enabled, for one key:
/// - DEL clears pending SETs and is appended
/// - SET after SET replaces the earlier payload
/// - DEL then SET keeps both, in order
///
/// Entries of one key are always handed out in arrival order.
pub struct Consumer<T> {
    config: ConsumerConfig,
    to_sync: BTreeMap<String, VecDeque<KeyedMutation<T>>>,
    pending_count: usize,
}

impl<T> Consumer<T> {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            to_sync: BTreeMap::new(),
            pending_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn add_to_sync(&mut self, entries: impl IntoIterator<Item = KeyedMutation<T>>) {
        for entry in entries {
            self.add_single_entry(entry);
        }
    }

    fn add_single_entry(&mut self, entry: KeyedMutation<T>) {
        let queue = self.to_sync.entry(entry.key.clone()).or_default();

        if !self.config.coalesce {
            queue.push_back(entry);
            self.pending_count += 1;
            return;
        }

        match entry.op {
            Operation::Del => {
                let dropped = queue.len();
                queue.retain(|pending| pending.op.is_del());
                self.pending_count -= dropped - queue.len();
                queue.push_back(entry);
                self.pending_count += 1;
            }
            Operation::Set => match queue.back_mut() {
                Some(last) if last.op.is_set() => *last = entry,
                _ => {
                    queue.push_back(entry);
                    self.pending_count += 1;
                }
            },
        }
    }

    /// Drains every pending entry, grouped by key.
    pub fn drain(&mut self) -> Vec<KeyedMutation<T>> {
        let result: Vec<_> = std::mem::take(&mut self.to_sync)
            .into_values()
            .flatten()
            .collect();
        self.pending_count = 0;
        result
    }

    /// Drains up to `batch_size` entries. A key is never split across
    /// batches unless its own queue exceeds the batch size.
    pub fn drain_batch(&mut self) -> Vec<KeyedMutation<T>> {
        let limit = self.config.batch_size;
        let mut result = Vec::new();

        while result.len() < limit {
            let Some(mut entry) = self.to_sync.first_entry() else {
                break;
            };
            let queue = entry.get_mut();
            if !result.is_empty() && result.len() + queue.len() > limit {
                break;
            }
            while result.len() < limit {
                match queue.pop_front() {
                    Some(mutation) => result.push(mutation),
                    None => break,
                }
            }
            if queue.is_empty() {
                entry.remove();
            }
        }

        self.pending_count -= result.len();
        result
    }

    /// Puts a failed entry back at the head of its key's queue.
    pub fn retry(&mut self, entry: KeyedMutation<T>) {
        let queue = self.to_sync.entry(entry.key.clone()).or_default();
        queue.push_front(entry);
        self.pending_count += 1;
    }

    pub fn clear(&mut self) {
        self.to_sync.clear();
        self.pending_count = 0;
    }
}

impl<T: Debug> Consumer<T> {
    pub fn dump(&self) -> Vec<String> {
        self.to_sync
            .iter()
            .flat_map(|(key, queue)| {
                queue.iter().map(move |e| {
                    let op = if e.op.is_set() { "SET" } else { "DEL" };
                    format!("{}: {} {:?}", key, op, e.payload)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn consumer() -> Consumer<u32> {
        Consumer::new(ConsumerConfig::new("routes"))
    }

    #[test]
    fn test_set_replaces_pending_set() {
        let mut consumer = consumer();
        consumer.add_to_sync(vec![
            KeyedMutation::set("100:1/10.0.0.0/24", 1),
            KeyedMutation::set("100:1/10.0.0.0/24", 2),
        ]);
        assert_eq!(consumer.pending_count(), 1);
        let entries = consumer.drain();
        assert_eq!(entries, vec![KeyedMutation::set("100:1/10.0.0.0/24", 2)]);
    }

    #[test]
    fn test_del_clears_pending_sets() {
        let mut consumer = consumer();
        consumer.add_to_sync(vec![
            KeyedMutation::set("k", 1),
            KeyedMutation::del("k", 9),
        ]);
        assert_eq!(consumer.pending_count(), 1);
        let entries = consumer.drain();
        assert!(entries[0].op.is_del());
        assert_eq!(entries[0].payload, 9);
    }

    #[test]
    fn test_del_then_set_keeps_order() {
        let mut consumer = consumer();
        consumer.add_to_sync(vec![KeyedMutation::del("k", 1), KeyedMutation::set("k", 2)]);
        let entries = consumer.drain();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].op.is_del());
        assert!(entries[1].op.is_set());
        assert!(!consumer.has_pending());
    }

    #[test]
    fn test_without_coalescing_keeps_everything() {
        let mut consumer = Consumer::new(ConsumerConfig::new("events").without_coalescing());
        consumer.add_to_sync(vec![
            KeyedMutation::set("k", 1),
            KeyedMutation::set("k", 2),
            KeyedMutation::del("k", 3),
        ]);
        let payloads: Vec<u32> = consumer.drain().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![1, 2, 3]);
    }

    #[test]
    fn test_drain_batch_respects_limit() {
        let mut consumer = Consumer::new(ConsumerConfig::new("routes").with_batch_size(2));
        consumer.add_to_sync(vec![
            KeyedMutation::set("a", 1),
            KeyedMutation::set("b", 2),
            KeyedMutation::set("c", 3),
        ]);
        assert_eq!(consumer.drain_batch().len(), 2);
        assert_eq!(consumer.pending_count(), 1);
        let rest = consumer.drain_batch();
        assert_eq!(rest, vec![KeyedMutation::set("c", 3)]);
        assert!(consumer.drain_batch().is_empty());
    }

    #[test]
    fn test_retry_goes_to_front() {
        let mut consumer = consumer();
        consumer.add_to_sync(vec![KeyedMutation::del("k", 2)]);
        consumer.retry(KeyedMutation::set("k", 1));
        let payloads: Vec<u32> = consumer.drain().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![1, 2]);
        assert_eq!(consumer.dump(), Vec::<String>::new());
    }
}
