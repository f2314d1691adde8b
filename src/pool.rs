//! ID pool - recycling allocator of small integers
//!
//! Hands out integers from a half-open range `[start, end)`. Freed values go
//! onto a LIFO free list and are reused before any never-issued value; fresh
//! values come from a high-water mark that only moves up.
//!
//! The free list storage is abstracted by [`IdStore`] so the same pool works
//! on the heap (`alloc::vec::Vec`) and in a fixed-size buffer
//! (`heapless::Vec`) before a heap exists.

use alloc::vec::Vec;

// ============================================================================
// Free list storage
// ============================================================================

/// Stack storage for freed IDs
pub trait IdStore<T> {
    /// Push a value. Returns false when the storage is full.
    fn push_id(&mut self, value: T) -> bool;
    /// Pop the most recently pushed value
    fn pop_id(&mut self) -> Option<T>;
    /// Whether the value is present
    fn contains_id(&self, value: &T) -> bool;
    /// Number of stored values
    fn len_ids(&self) -> usize;
    /// Remove everything
    fn clear_ids(&mut self);
}

impl<T: PartialEq> IdStore<T> for Vec<T> {
    fn push_id(&mut self, value: T) -> bool {
        self.push(value);
        true
    }

    fn pop_id(&mut self) -> Option<T> {
        self.pop()
    }

    fn contains_id(&self, value: &T) -> bool {
        self.contains(value)
    }

    fn len_ids(&self) -> usize {
        self.len()
    }

    fn clear_ids(&mut self) {
        self.clear();
    }
}

impl<T: PartialEq, const N: usize> IdStore<T> for heapless::Vec<T, N> {
    fn push_id(&mut self, value: T) -> bool {
        self.push(value).is_ok()
    }

    fn pop_id(&mut self) -> Option<T> {
        self.pop()
    }

    fn contains_id(&self, value: &T) -> bool {
        self.contains(value)
    }

    fn len_ids(&self) -> usize {
        self.len()
    }

    fn clear_ids(&mut self) {
        self.clear();
    }
}

// ============================================================================
// ID Pool
// ============================================================================

/// Recycling integer allocator over `[start, end)`
#[derive(Debug, Clone)]
pub struct IdPool<S = Vec<usize>> {
    start: usize,
    end: usize,
    /// Next never-issued value
    next: usize,
    free: S,
}

impl IdPool<Vec<usize>> {
    /// Create a heap-backed pool over `[start, end)`
    pub fn new(start: usize, end: usize) -> Self {
        Self::with_store(start, end, Vec::new())
    }
}

impl<S: IdStore<usize>> IdPool<S> {
    /// Create a pool using caller-provided free list storage.
    ///
    /// An empty or inverted range yields a pool that never allocates.
    pub fn with_store(start: usize, end: usize, mut free: S) -> Self {
        free.clear_ids();
        Self {
            start,
            end: end.max(start),
            next: start,
            free,
        }
    }

    /// Allocate an ID, preferring the most recently freed one
    pub fn alloc(&mut self) -> Option<usize> {
        if let Some(id) = self.free.pop_id() {
            return Some(id);
        }
        if self.next >= self.end {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    /// Return an ID to the pool.
    ///
    /// IDs outside the range or never issued are ignored, as are IDs that
    /// are already free. Returns whether the ID was recycled.
    pub fn free(&mut self, id: usize) -> bool {
        if id < self.start || id >= self.next {
            return false;
        }
        if self.free.contains_id(&id) {
            return false;
        }
        self.free.push_id(id)
    }

    /// Whether `id` is currently free.
    ///
    /// Out-of-range values are never free. Values above the high-water mark
    /// have never been issued and count as free.
    pub fn is_free(&self, id: usize) -> bool {
        if id < self.start || id >= self.end {
            return false;
        }
        if id >= self.next {
            return true;
        }
        self.free.contains_id(&id)
    }

    /// Number of IDs currently handed out
    pub fn in_use(&self) -> usize {
        (self.next - self.start) - self.free.len_ids()
    }

    /// Number of IDs still available
    pub fn available(&self) -> usize {
        (self.end - self.next) + self.free.len_ids()
    }

    /// First ID of the range
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last ID of the range
    pub fn end(&self) -> usize {
        self.end
    }

    /// Total number of IDs in the range
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sequential() {
        let mut pool = IdPool::new(1, 4);
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(2));
        assert_eq!(pool.alloc(), Some(3));
        assert_eq!(pool.alloc(), None);
    }

    #[test]
    fn test_pool_lifo_reuse() {
        let mut pool = IdPool::new(10, 20);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.free(a));
        assert!(pool.free(b));
        assert_eq!(pool.alloc(), Some(b));
        assert_eq!(pool.alloc(), Some(a));
        assert_eq!(pool.alloc(), Some(12));
    }

    #[test]
    fn test_pool_ignores_bogus_free() {
        let mut pool = IdPool::new(1, 8);
        assert!(!pool.free(0));
        assert!(!pool.free(5));
        let id = pool.alloc().unwrap();
        assert!(pool.free(id));
        assert!(!pool.free(id));
        assert_eq!(pool.available(), 7);
    }

    #[test]
    fn test_pool_is_free() {
        let mut pool = IdPool::new(1, 4);
        assert!(!pool.is_free(0));
        assert!(!pool.is_free(4));
        assert!(pool.is_free(3));
        let id = pool.alloc().unwrap();
        assert!(!pool.is_free(id));
        pool.free(id);
        assert!(pool.is_free(id));
    }

    #[test]
    fn test_pool_heapless_store() {
        let store: heapless::Vec<usize, 4> = heapless::Vec::new();
        let mut pool = IdPool::with_store(0, 4, store);
        let ids: Vec<usize> = core::iter::from_fn(|| pool.alloc()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        for id in ids {
            assert!(pool.free(id));
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.alloc(), Some(3));
    }

    #[test]
    fn test_pool_empty_range() {
        let mut pool = IdPool::new(5, 5);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.alloc(), None);
    }
}
