//! Context key to queue lookup.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;

use super::queue::ContextQueue;
use crate::config::{DispatcherConfig, QueueMode};
use crate::model::ContextKey;

pub(crate) enum QueueTable {
    /// Fixed array created at startup; never grows, never evicts.
    Sharded(Box<[Arc<ContextQueue>]>),
    /// One queue per live key. Idle, empty queues are retired and removed.
    PerKey {
        queues: DashMap<ContextKey, Arc<ContextQueue>>,
        capacity: usize,
    },
}

impl QueueTable {
    pub(crate) fn new(config: &DispatcherConfig) -> Self {
        match config.mode {
            QueueMode::Sharded => QueueTable::Sharded(
                (0..config.shards)
                    .map(|index| Arc::new(ContextQueue::new(index, None, config.queue_capacity)))
                    .collect(),
            ),
            QueueMode::PerKey => QueueTable::PerKey {
                queues: DashMap::new(),
                capacity: config.queue_capacity,
            },
        }
    }

    pub(crate) fn mode(&self) -> QueueMode {
        match self {
            QueueTable::Sharded(_) => QueueMode::Sharded,
            QueueTable::PerKey { .. } => QueueMode::PerKey,
        }
    }

    /// The queue serving `key`, created on demand in per-key mode.
    pub(crate) fn lookup(&self, key: &ContextKey) -> Arc<ContextQueue> {
        match self {
            QueueTable::Sharded(shards) => Arc::clone(&shards[shard_index(key, shards.len())]),
            QueueTable::PerKey { queues, capacity } => {
                let entry = queues.entry(key.clone()).or_insert_with(|| {
                    Arc::new(ContextQueue::new(0, Some(key.clone()), *capacity))
                });
                Arc::clone(entry.value())
            }
        }
    }

    /// Drop `queue` from a per-key table if it is still idle and empty.
    /// No-op for shards.
    pub(crate) fn evict_if_idle(&self, queue: &Arc<ContextQueue>) {
        let QueueTable::PerKey { queues, .. } = self else {
            return;
        };
        let Some(key) = queue.key() else {
            return;
        };
        queues.remove_if(key, |_, current| {
            Arc::ptr_eq(current, queue) && current.try_retire()
        });
    }

    /// Every queue currently in the table. The table lock is released before
    /// this returns.
    pub(crate) fn queues(&self) -> Vec<Arc<ContextQueue>> {
        match self {
            QueueTable::Sharded(shards) => shards.to_vec(),
            QueueTable::PerKey { queues, .. } => {
                queues.iter().map(|entry| Arc::clone(entry.value())).collect()
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            QueueTable::Sharded(shards) => shards.len(),
            QueueTable::PerKey { queues, .. } => queues.len(),
        }
    }
}

/// Stable shard for `key` within this process.
pub fn shard_index(key: &ContextKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::{Advance, Enqueued};
    use crate::model::Task;

    #[test]
    fn sharded_lookup_is_stable() {
        let table = QueueTable::new(&DispatcherConfig::sharded(8, 16));
        let a = table.lookup(&ContextKey::from("sess-1"));
        let b = table.lookup(&ContextKey::from("sess-1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn per_key_evicts_only_idle_queues() {
        let table = QueueTable::new(&DispatcherConfig::per_key(16));
        let key = ContextKey::from("sess-1");
        let queue = table.lookup(&key);
        let Enqueued::DispatchNow(running) = queue.enqueue(Task::new("sess-1", || {})) else {
            panic!("idle queue should dispatch");
        };

        table.evict_if_idle(&queue);
        assert_eq!(table.len(), 1);

        assert!(matches!(queue.on_task_finished(running.ticket), Advance::Idle));
        table.evict_if_idle(&queue);
        assert_eq!(table.len(), 0);

        let fresh = table.lookup(&key);
        assert!(!Arc::ptr_eq(&queue, &fresh));
    }
}
