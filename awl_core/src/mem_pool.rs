//! Setup-time memory pool.
//!
//! All buffers the streaming core needs are drawn from a single pool with a
//! fixed byte budget, once, during initialization. There is no free in steady
//! state; `reset` exists for teardown. After setup completes, the audio path
//! performs no allocation.

use alloc::{boxed::Box, vec};

/// Alignment every allocation is rounded up to, in bytes.
const POOL_ALIGN: usize = 4;

/// A memory pool with a fixed capacity, consumed monotonically at setup.
///
/// Allocations are rounded up to [`POOL_ALIGN`] bytes, zero-initialized and
/// accounted against the budget. Exhaustion returns `None` and the caller
/// reports it as an out-of-memory error.
///
/// # Examples
///
/// ```
/// use awl_core::MemPool;
///
/// let mut pool = MemPool::new(64);
/// let buf = pool.alloc_bytes(10).unwrap();
/// assert_eq!(buf.len(), 10);
/// assert_eq!(pool.allocated_bytes(), 12); // rounded up to 4 bytes
/// ```
pub struct MemPool {
    capacity: usize,
    free_bytes: usize,
}

impl MemPool {
    /// Create a pool with the given byte budget.
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free_bytes: capacity,
        }
    }

    /// Allocate a zeroed byte buffer, accounting the aligned size.
    ///
    /// Returns `None` when the remaining budget cannot cover the request.
    pub fn alloc_bytes(&mut self, size: usize) -> Option<Box<[u8]>> {
        self.take(size)?;
        Some(vec![0u8; size].into_boxed_slice())
    }

    /// Allocate a zeroed slice of `len` elements of `T`.
    pub fn alloc_slice<T: Default + Clone>(&mut self, len: usize) -> Option<Box<[T]>> {
        self.take(len * core::mem::size_of::<T>())?;
        Some(vec![T::default(); len].into_boxed_slice())
    }

    /// Number of bytes consumed so far.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.capacity - self.free_bytes
    }

    /// Total byte budget.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the pool to its pristine state.
    ///
    /// Only valid at teardown; buffers handed out earlier are owned by their
    /// holders and must be dropped along with them.
    pub fn reset(&mut self) {
        self.free_bytes = self.capacity;
    }

    fn take(&mut self, size: usize) -> Option<()> {
        let aligned = size
            .checked_add(POOL_ALIGN - 1)?
            .checked_div(POOL_ALIGN)?
            .checked_mul(POOL_ALIGN)?;
        if aligned > self.free_bytes {
            return None;
        }
        self.free_bytes -= aligned;
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_round_up() {
        let mut pool = MemPool::new(64);
        pool.alloc_bytes(1).unwrap();
        assert_eq!(pool.allocated_bytes(), 4);
        pool.alloc_bytes(5).unwrap();
        assert_eq!(pool.allocated_bytes(), 12);
    }

    #[test]
    fn test_exhaustion_boundary() {
        let mut pool = MemPool::new(16);
        // Four 4-byte allocations succeed, the fifth fails.
        for _ in 0..4 {
            assert!(pool.alloc_bytes(4).is_some());
        }
        assert!(pool.alloc_bytes(1).is_none());
        assert_eq!(pool.allocated_bytes(), 16);
    }

    #[test]
    fn test_zero_initialized() {
        let mut pool = MemPool::new(64);
        let buf = pool.alloc_bytes(16).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_typed_allocation() {
        let mut pool = MemPool::new(64);
        let words = pool.alloc_slice::<i32>(8).unwrap();
        assert_eq!(words.len(), 8);
        assert_eq!(pool.allocated_bytes(), 32);
    }

    #[test]
    fn test_reset() {
        let mut pool = MemPool::new(8);
        pool.alloc_bytes(8).unwrap();
        assert!(pool.alloc_bytes(1).is_none());
        pool.reset();
        assert!(pool.alloc_bytes(8).is_some());
    }
}
