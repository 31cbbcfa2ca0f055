//! Session identity type and the bounded identity pool
//!
//! An `Identity` is the application-facing name of a session. It is
//! deliberately distinct from the socket fd: the kernel reuses fd numbers
//! as soon as they are closed, while identities are handed out by the pool
//! below and only come back when the owner of the pool returns them.

use core::fmt;

use crossbeam_queue::ArrayQueue;

use crate::error::{Error, Result};

/// Logical session reference
///
/// A 32-bit value issued by an `IdentityPool`.
/// The maximum value (u32::MAX) is reserved as a sentinel for "no session".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Identity(u32);

impl Identity {
    /// Sentinel value indicating no session
    pub const NONE: Identity = Identity(u32::MAX);

    /// Create an identity from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        Identity(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

impl From<u32> for Identity {
    #[inline]
    fn from(id: u32) -> Self {
        Identity(id)
    }
}

impl From<Identity> for u32 {
    #[inline]
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Identity(NONE)")
        } else {
            write!(f, "Identity({})", self.0)
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Identity::NONE
    }
}

/// Bounded FIFO pool of identities
///
/// Seeded with `0..capacity` at construction. `acquire` pops the oldest free
/// identity, `release` appends at the tail, so a just-released identity is
/// the last one to be handed out again.
///
/// Lock-free: backed by a `crossbeam_queue::ArrayQueue`, safe to share
/// between the accept path and the close path without extra locking.
pub struct IdentityPool {
    free: ArrayQueue<Identity>,
}

impl IdentityPool {
    /// Create a pool holding identities `0..capacity`.
    ///
    /// `capacity` is clamped to `1..u32::MAX` so the NONE sentinel is never
    /// issued.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize - 1);
        let free = ArrayQueue::new(capacity);
        for id in 0..capacity as u32 {
            // Cannot fail: the queue was sized to hold exactly this many.
            let _ = free.push(Identity::new(id));
        }
        Self { free }
    }

    /// Take the oldest free identity.
    ///
    /// An empty pool is a capacity condition: the caller refuses the
    /// connection without registering it anywhere.
    #[inline]
    pub fn acquire(&self) -> Result<Identity> {
        self.free.pop().ok_or(Error::IdentityExhausted)
    }

    /// Return an identity to the tail of the pool.
    ///
    /// Returns false if the pool is already full (the identity was not
    /// issued by this pool, or was released twice).
    #[inline]
    pub fn release(&self, id: Identity) -> bool {
        if id.is_none() {
            return false;
        }
        self.free.push(id).is_ok()
    }

    /// Number of identities currently available
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of identities this pool manages
    #[inline]
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Check if no identity is available
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }
}

impl fmt::Debug for IdentityPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityPool")
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_identity_basics() {
        let id = Identity::new(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(id.as_usize(), 42);
        assert!(!id.is_none());
        assert!(Identity::NONE.is_none());
        assert_eq!(Identity::default(), Identity::NONE);
        assert_eq!(format!("{}", Identity::NONE), "none");
    }

    #[test]
    fn test_pool_is_fifo() {
        let pool = IdentityPool::new(3);
        assert_eq!(pool.acquire().unwrap(), Identity::new(0));
        assert_eq!(pool.acquire().unwrap(), Identity::new(1));

        assert!(pool.release(Identity::new(0)));
        // 2 was queued before the released 0
        assert_eq!(pool.acquire().unwrap(), Identity::new(2));
        assert_eq!(pool.acquire().unwrap(), Identity::new(0));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = IdentityPool::new(2);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(pool.is_exhausted());
        assert!(matches!(pool.acquire(), Err(Error::IdentityExhausted)));
    }

    #[test]
    fn test_release_into_full_pool_is_refused() {
        let pool = IdentityPool::new(1);
        assert!(!pool.release(Identity::new(7)));
        assert!(!pool.release(Identity::NONE));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_concurrent_acquire_is_unique() {
        let pool = Arc::new(IdentityPool::new(4000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(id) = pool.acquire() {
                        got.push(id);
                    }
                    got
                })
            })
            .collect();

        let mut all = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.join().unwrap() {
                total += 1;
                assert!(all.insert(id), "identity {} issued twice", id);
            }
        }
        assert_eq!(total, 4000);
    }
}
