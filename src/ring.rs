//! Fixed-capacity ring buffer with push-and-evict semantics
//!
//! Replaces the manually capped arrays the breath pipeline needs for
//! inhale/exhale/cycle timestamps and plot points. Tracks how many
//! elements were pushed over its lifetime so callers can index by
//! absolute position even after old entries have been evicted.

use std::collections::VecDeque;

/// Bounded ring buffer. Pushing beyond capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    buf: VecDeque<T>,
    cap: usize,
    total: u64,
}

impl<T> Ring<T> {
    /// Create a ring with the given capacity. Panics if capacity is zero.
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "ring capacity must be non-zero");
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
            total: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Total number of elements ever pushed (including evicted ones).
    pub fn total_pushed(&self) -> u64 {
        self.total
    }

    /// Absolute index of the oldest retained element.
    pub fn start_index(&self) -> u64 {
        self.total - self.buf.len() as u64
    }

    /// Look up by absolute push index. Returns None if the element was
    /// evicted or has not been pushed yet.
    pub fn get_abs(&self, index: u64) -> Option<&T> {
        if index < self.start_index() || index >= self.total {
            return None;
        }
        self.buf.get((index - self.start_index()) as usize)
    }

    pub fn back(&self) -> Option<&T> {
        self.buf.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    /// Drop all elements and reset the lifetime counter.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.total = 0;
    }
}
