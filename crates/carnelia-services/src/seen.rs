//! Grow-only set of broadcast values this node has accepted.

use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
pub struct SeenValues {
    values: Mutex<HashSet<i64>>,
}

impl SeenValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set. Returns `true` when `value` was not seen before.
    pub fn insert(&self, value: i64) -> bool {
        self.values.lock().insert(value)
    }

    pub fn contains(&self, value: i64) -> bool {
        self.values.lock().contains(&value)
    }

    /// Every accepted value, in no particular order.
    pub fn snapshot(&self) -> Vec<i64> {
        self.values.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}
