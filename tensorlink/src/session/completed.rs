//! Recently completed request tags, for `Session::is_complete`.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// The last `capacity` tags recorded, oldest forgotten first.
///
/// A tag recorded twice occupies two places in the ring and is remembered
/// until both have been evicted.
pub(super) struct CompletedTags {
    capacity: usize,
    order: VecDeque<Bytes>,
    counts: HashMap<Bytes, usize>,
}

impl CompletedTags {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            counts: HashMap::new(),
        }
    }

    pub fn record(&mut self, tag: Bytes) {
        *self.counts.entry(tag.clone()).or_default() += 1;
        self.order.push_back(tag);
        while self.order.len() > self.capacity {
            let Some(old) = self.order.pop_front() else {
                break;
            };
            if let Some(n) = self.counts.get_mut(&old) {
                *n -= 1;
                if *n == 0 {
                    self.counts.remove(&old);
                }
            }
        }
    }

    pub fn contains(&self, tag: &[u8]) -> bool {
        self.counts.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
