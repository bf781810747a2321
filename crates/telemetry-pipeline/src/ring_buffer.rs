// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity circular buffers, one per record kind.
//!
//! Once a buffer is full each push overwrites the oldest slot and advances the
//! write cursor. Snapshots always come back oldest-to-newest: the slots from
//! the cursor to the end, then the slots before the cursor.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::record::{Record, RecordKind};

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: Vec<T>,
    capacity: usize,
    /// Next slot to overwrite once `items.len() == capacity`.
    cursor: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// A zero capacity is bumped to one so a push is always retained.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity.min(4096)),
            capacity,
            cursor: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        self.items[self.cursor] = item;
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    /// All retained items, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.items.len());
        out.extend_from_slice(&self.items[self.cursor..]);
        out.extend_from_slice(&self.items[..self.cursor]);
        out
    }

    /// The newest `limit` items, oldest first.
    #[must_use]
    pub fn latest(&self, limit: usize) -> Vec<T> {
        let mut snapshot = self.snapshot();
        if snapshot.len() > limit {
            snapshot.drain(..snapshot.len() - limit);
        }
        snapshot
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empties the buffer and returns how many items were dropped.
    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        self.cursor = 0;
        removed
    }
}

/// Occupancy of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferCount {
    pub length: usize,
    pub capacity: usize,
}

/// One [`RingBuffer`] per [`RecordKind`], all with the same capacity.
#[derive(Debug, Clone)]
pub struct RingStore {
    buffers: [RingBuffer<Arc<Record>>; 5],
}

impl RingStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: std::array::from_fn(|_| RingBuffer::new(capacity)),
        }
    }

    /// Stores a record in the buffer matching its kind.
    pub fn push(&mut self, record: Arc<Record>) {
        self.buffers[record.kind().index()].push(record);
    }

    #[must_use]
    pub fn snapshot(&self, kind: RecordKind) -> Vec<Arc<Record>> {
        self.buffers[kind.index()].snapshot()
    }

    #[must_use]
    pub fn latest(&self, kind: RecordKind, limit: usize) -> Vec<Arc<Record>> {
        self.buffers[kind.index()].latest(limit)
    }

    #[must_use]
    pub fn counts(&self) -> BTreeMap<RecordKind, BufferCount> {
        RecordKind::ALL
            .iter()
            .map(|kind| {
                let buffer = &self.buffers[kind.index()];
                (
                    *kind,
                    BufferCount {
                        length: buffer.len(),
                        capacity: buffer.capacity(),
                    },
                )
            })
            .collect()
    }

    /// Empties every buffer, returning the total number of records removed.
    pub fn clear(&mut self) -> usize {
        self.buffers.iter_mut().map(RingBuffer::clear).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogItem, RequestItem};
    use proptest::prelude::*;

    fn log(t: i64) -> Arc<Record> {
        Arc::new(Record::Log(LogItem {
            t,
            message: format!("log {t}"),
            ..Default::default()
        }))
    }

    #[test]
    fn test_snapshot_before_wrap_is_push_order() {
        let mut buffer = RingBuffer::new(4);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.snapshot(), vec![1, 2]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_wrap_overwrites_oldest() {
        let mut buffer = RingBuffer::new(3);
        for i in 1..=5 {
            buffer.push(i);
        }
        assert_eq!(buffer.snapshot(), vec![3, 4, 5]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.latest(2), vec![4, 5]);
        assert_eq!(buffer.latest(10), vec![3, 4, 5]);
    }

    #[test]
    fn test_zero_capacity_keeps_one_item() {
        let mut buffer = RingBuffer::new(0);
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.snapshot(), vec!["b"]);
        assert_eq!(buffer.capacity(), 1);
    }

    #[test]
    fn test_store_routes_by_kind_and_counts() {
        let mut store = RingStore::new(2);
        store.push(log(1));
        store.push(Arc::new(Record::Request(RequestItem {
            t: 2,
            ..Default::default()
        })));
        store.push(log(3));
        store.push(log(4));

        let counts = store.counts();
        assert_eq!(
            counts[&RecordKind::Logs],
            BufferCount {
                length: 2,
                capacity: 2
            }
        );
        assert_eq!(counts[&RecordKind::Requests].length, 1);
        assert_eq!(counts[&RecordKind::Raw].length, 0);

        let logs: Vec<i64> = store
            .snapshot(RecordKind::Logs)
            .iter()
            .map(|r| r.timestamp())
            .collect();
        assert_eq!(logs, vec![3, 4]);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut store = RingStore::new(10);
        store.push(log(1));
        store.push(log(2));
        assert_eq!(store.clear(), 2);
        assert_eq!(store.clear(), 0);
        assert!(store.counts().values().all(|c| c.length == 0));
    }

    proptest! {
        #[test]
        fn test_wrap_keeps_last_capacity_items(capacity in 1usize..64, extra in 1usize..200) {
            let mut buffer = RingBuffer::new(capacity);
            let total = capacity + extra;
            for i in 0..total {
                buffer.push(i);
            }
            let expected: Vec<usize> = (total - capacity..total).collect();
            prop_assert_eq!(buffer.snapshot(), expected);
        }
    }
}
