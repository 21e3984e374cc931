//! Fence-keyed deferred release.
//!
//! Anything the GPU might still read is not destroyed when its owner drops.
//! It is tagged with the fence value the current frame will signal and
//! released once the fence's completed value reaches that tag.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::descriptor::DescriptorCategory;
use crate::types::ResourceId;

/// Something waiting for the GPU to finish with it.
pub enum Retired {
    Descriptor {
        category: DescriptorCategory,
        first: u32,
        count: u32,
    },
    Resource(ResourceId),
    Callback(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for Retired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Descriptor {
                category,
                first,
                count,
            } => write!(f, "Descriptor({category:?}, {first}+{count})"),
            Self::Resource(id) => write!(f, "Resource({id:?})"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// FIFO of retired objects ordered by fence value.
pub struct RetireQueue {
    pending: Mutex<VecDeque<(u64, Retired)>>,
    cursor: AtomicU64,
}

impl RetireQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            cursor: AtomicU64::new(0),
        }
    }

    /// Sets the fence value that work recorded from now on will signal.
    pub fn set_cursor(&self, value: u64) {
        self.cursor.store(value, Ordering::Release);
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Tags an item with the current cursor and queues it.
    pub fn retire(&self, item: Retired) {
        let value = self.cursor();
        self.pending.lock().push_back((value, item));
    }

    /// Removes every item whose tag is at or below `completed`, oldest first.
    pub fn drain_completed(&self, completed: u64) -> Vec<Retired> {
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        while let Some((value, _)) = pending.front() {
            if *value > completed {
                break;
            }
            if let Some((_, item)) = pending.pop_front() {
                ready.push(item);
            }
        }
        ready
    }

    /// Removes everything. Only valid once the GPU is idle.
    pub fn drain_all(&self) -> Vec<Retired> {
        self.pending.lock().drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RetireQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_wait_for_their_fence_value() {
        let queue = RetireQueue::new();
        queue.set_cursor(1);
        queue.retire(Retired::Callback(Box::new(|| {})));
        queue.set_cursor(2);
        queue.retire(Retired::Callback(Box::new(|| {})));

        assert!(queue.drain_completed(0).is_empty());
        assert_eq!(queue.drain_completed(1).len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain_completed(5).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_all_keeps_order() {
        let queue = RetireQueue::new();
        queue.set_cursor(9);
        queue.retire(Retired::Descriptor {
            category: DescriptorCategory::Texture,
            first: 4,
            count: 1,
        });
        queue.retire(Retired::Callback(Box::new(|| {})));

        let items = queue.drain_all();
        assert!(matches!(items[0], Retired::Descriptor { first: 4, .. }));
        assert!(matches!(items[1], Retired::Callback(_)));
    }
}
