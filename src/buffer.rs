//! Fixed-slot buffer pool
//!
//! Hot receive and send paths reuse a bounded set of pre-sized buffers to
//! avoid per-message heap churn. The pool never grows: under pressure
//! `acquire` returns `None` and callers fall back to a plain allocation,
//! which the pool accounts as a miss.
//!
//! Returned buffers are handed out newest-first (LIFO) for cache locality.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;

/// Default number of slots for carriers that do not configure one.
pub const DEFAULT_POOL_SLOTS: usize = 32;

/// Default slot size; receive-buffer growth rounds to this so returned
/// buffers stay pool-eligible.
pub const DEFAULT_SLOT_SIZE: usize = 4096;

/// Counters describing pool effectiveness.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    /// `acquire` calls satisfied from the pool.
    pub hits: u64,
    /// `acquire` calls that found the pool empty.
    pub misses: u64,
    /// `release` calls that returned a buffer to the pool.
    pub returns: u64,
    /// `release` calls that dropped the buffer (pool full or wrong size).
    pub discards: u64,
}

/// A bounded pool of fixed-size reusable buffers.
#[derive(Debug)]
pub struct BufferPool {
    slots: Mutex<Vec<BytesMut>>,
    capacity: usize,
    slot_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    returns: AtomicU64,
    discards: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers, each `slot_size` bytes.
    ///
    /// All buffers are allocated up front; the pool never allocates again.
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| BytesMut::with_capacity(slot_size))
            .collect();
        Self {
            slots: Mutex::new(slots),
            capacity,
            slot_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// The size every slot was allocated with.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Take a buffer from the pool, or `None` under pressure.
    ///
    /// The returned buffer is empty with at least `slot_size` capacity.
    pub fn acquire(&self) -> Option<BytesMut> {
        let mut slots = self.slots.lock().expect("buffer pool lock poisoned");
        match slots.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(buf)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers that shrank below the slot size, or that arrive while the
    /// pool is already full, are dropped instead of stored.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() < self.slot_size {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut slots = self.slots.lock().expect("buffer pool lock poisoned");
        if slots.len() >= self.capacity {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        slots.push(buf);
        self.returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}

/// Round `needed` up to the next multiple of `slot` (at least one slot).
///
/// Receive buffers grow by 1.5x and then round to the pool slot size so a
/// released buffer always fits back into the pool.
pub fn round_to_slot(needed: usize, slot: usize) -> usize {
    let slot = slot.max(1);
    needed.div_ceil(slot).max(1) * slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_capacity_then_none() {
        let pool = BufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop((a, b));

        let stats = pool.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_release_makes_buffer_reusable() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(b"junk");
        pool.release(buf);

        let again = pool.acquire().unwrap();
        assert!(again.is_empty(), "released buffers come back cleared");
        assert!(again.capacity() >= 64);
    }

    #[test]
    fn test_release_discards_when_full() {
        let pool = BufferPool::new(1, 64);
        pool.release(BytesMut::with_capacity(64));
        assert_eq!(pool.stats().discards, 1);
    }

    #[test]
    fn test_release_discards_undersized_buffer() {
        let pool = BufferPool::new(2, 64);
        let _hold = pool.acquire().unwrap();
        pool.release(BytesMut::with_capacity(8));
        assert_eq!(pool.stats().discards, 1);
    }

    #[test]
    fn test_lifo_reuse_order() {
        let pool = BufferPool::new(2, 16);
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();

        let mut marked = first;
        marked.extend_from_slice(b"x");
        let marked_cap = marked.capacity();
        pool.release(marked);

        // Newest-returned buffer comes back first.
        let got = pool.acquire().unwrap();
        assert_eq!(got.capacity(), marked_cap);
    }

    #[test]
    fn test_round_to_slot() {
        assert_eq!(round_to_slot(1, 4096), 4096);
        assert_eq!(round_to_slot(4096, 4096), 4096);
        assert_eq!(round_to_slot(4097, 4096), 8192);
        assert_eq!(round_to_slot(0, 4096), 4096);
    }
}
