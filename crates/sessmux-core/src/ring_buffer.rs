//! Cursor-based growable byte buffer
//!
//! Each session owns two of these: one receive buffer the engine writes into
//! and the reassembler reads from, and one send buffer the application
//! stages into and the engine drains.
//!
//! ```text
//!  0            read           write               capacity
//!  ├──consumed───┼───readable────┼─────writable──────┤
//! ```
//!
//! Invariant: `read <= write <= capacity`. Bytes are appended at `write`
//! and consumed at `read`; when the tail runs short, `ensure_writable`
//! first compacts (slides the readable bytes to offset 0) and only grows
//! the allocation if compaction was not enough.

use crate::error::{Error, Result};

pub struct RingBuffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
    /// Hard ceiling for growth (`usize::MAX` = unbounded)
    limit: usize,
}

impl RingBuffer {
    /// Create a buffer with `capacity` bytes and no growth ceiling.
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX)
    }

    /// Create a buffer with `capacity` bytes that never grows past `limit`.
    pub fn with_limit(capacity: usize, limit: usize) -> Self {
        let capacity = capacity.min(limit);
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            limit,
        }
    }

    /// Bytes available to read
    #[inline]
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Bytes that can be appended without compaction or growth
    #[inline]
    pub fn writable(&self) -> usize {
        self.data.len() - self.write
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read
    }

    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// The readable region, starting at the read cursor.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// The writable tail, starting at the write cursor.
    ///
    /// Fill it (e.g. with `read(2)`), then call `advance_write` with the
    /// number of bytes actually written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }

    /// Look at the first `n` readable bytes without consuming them.
    #[inline]
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if n > self.readable() {
            return None;
        }
        Some(&self.data[self.read..self.read + n])
    }

    /// Commit `n` bytes written into `write_slice`.
    pub fn advance_write(&mut self, n: usize) -> Result<()> {
        if n > self.writable() {
            return Err(Error::BufferOverflow {
                needed: self.write + n,
                limit: self.data.len(),
            });
        }
        self.write += n;
        Ok(())
    }

    /// Drop `n` readable bytes.
    ///
    /// Consuming everything rewinds both cursors to 0, which keeps the
    /// common "whole frame consumed" case from ever needing compaction.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.readable() {
            return Err(Error::BufferOverflow {
                needed: n,
                limit: self.readable(),
            });
        }
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
        Ok(())
    }

    /// Copy `bytes` in at the write cursor, compacting/growing as needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_writable(bytes.len())?;
        let start = self.write;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        Ok(())
    }

    /// Guarantee at least `n` writable bytes.
    ///
    /// Compacts first; grows (doubling, capped at `limit`) only if the
    /// buffer is still short. Fails without modifying the readable bytes
    /// when `readable + n` exceeds the limit.
    pub fn ensure_writable(&mut self, n: usize) -> Result<()> {
        if self.writable() >= n {
            return Ok(());
        }

        let readable = self.readable();
        let needed = readable.checked_add(n).ok_or(Error::BufferOverflow {
            needed: usize::MAX,
            limit: self.limit,
        })?;
        if needed > self.limit {
            return Err(Error::BufferOverflow {
                needed,
                limit: self.limit,
            });
        }

        if self.read > 0 {
            self.data.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = readable;
            if self.writable() >= n {
                return Ok(());
            }
        }

        let mut new_cap = self.data.len().max(1);
        while new_cap < needed {
            new_cap = new_cap.saturating_mul(2);
        }
        let new_cap = new_cap.min(self.limit);

        let mut grown = vec![0u8; new_cap].into_boxed_slice();
        grown[..readable].copy_from_slice(&self.data[..readable]);
        self.data = grown;
        Ok(())
    }

    /// Discard all bytes.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("capacity", &self.data.len())
            .finish()
    }
}
