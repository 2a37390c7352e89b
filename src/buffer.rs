//! Zero-copy segmented byte buffer.
//!
//! A buffer owns one contiguous allocation split into three regions —
//! head, data (the payload), tail — by two movable offsets, `data_start`
//! and `tail_start`. The allocation's own start and end never move once
//! made; only the two offsets slide within `[0, true_len]`, which is why
//! `pull`/`push`/`pull_tail`/`push_tail` are O(1) index arithmetic rather
//! than copies. Grounded on `silcbuffer.h` in full.

use crate::error::BufferError;
use crate::tls;

/// A segmented byte buffer. See the module docs for the head/data/tail
/// layout this type implements.
#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    data_start: usize,
    tail_start: usize,
}

impl Buffer {
    /// Allocates `capacity` bytes with an empty payload positioned at
    /// offset 0 (all of `capacity` is initially head+tail reserve).
    pub fn alloc(capacity: usize) -> Buffer {
        Buffer {
            storage: vec![0u8; capacity],
            data_start: 0,
            tail_start: 0,
        }
    }

    /// Allocates `capacity` bytes with the payload already occupying the
    /// full capacity (`tail_start == end`).
    pub fn alloc_sized(capacity: usize) -> Buffer {
        Buffer {
            storage: vec![0u8; capacity],
            data_start: 0,
            tail_start: capacity,
        }
    }

    /// Total size of the backing allocation (`end - head_start`).
    pub fn true_len(&self) -> usize {
        self.storage.len()
    }

    /// Size of the head reserve (`data_start - head_start`).
    pub fn head_len(&self) -> usize {
        self.data_start
    }

    /// Size of the logical payload (`tail_start - data_start`).
    pub fn data_len(&self) -> usize {
        self.tail_start - self.data_start
    }

    /// Size of the tail reserve (`end - tail_start`).
    pub fn tail_len(&self) -> usize {
        self.storage.len() - self.tail_start
    }

    /// The current payload, `[data_start, tail_start)`.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data_start..self.tail_start]
    }

    /// Sets data_start = tail_start = head_start, retaining the memory
    /// and its contents.
    pub fn reset(&mut self) {
        self.data_start = 0;
        self.tail_start = 0;
    }

    /// Zeroes all `true_len` bytes, then resets.
    pub fn clear(&mut self) {
        for b in self.storage.iter_mut() {
            *b = 0;
        }
        self.reset();
    }

    /// Advances `data_start` by `n`, consuming a header prefix of the
    /// payload. Returns the old `data_start`.
    pub fn pull(&mut self, n: usize) -> Result<usize, BufferError> {
        if n > self.data_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: n,
                available: self.data_len(),
            });
        }
        let old = self.data_start;
        self.data_start += n;
        Ok(old)
    }

    /// Retreats `data_start` by `n`, the symmetric inverse of [`Buffer::pull`].
    pub fn push(&mut self, n: usize) -> Result<usize, BufferError> {
        if n > self.head_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: n,
                available: self.head_len(),
            });
        }
        let old = self.data_start;
        self.data_start -= n;
        Ok(old)
    }

    /// Advances `tail_start` by `n`, growing the payload at its trailing edge.
    pub fn pull_tail(&mut self, n: usize) -> Result<usize, BufferError> {
        if n > self.tail_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: n,
                available: self.tail_len(),
            });
        }
        let old = self.tail_start;
        self.tail_start += n;
        Ok(old)
    }

    /// Retreats `tail_start` by `n`, shrinking the payload at its trailing edge.
    pub fn push_tail(&mut self, n: usize) -> Result<usize, BufferError> {
        if n > self.data_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: n,
                available: self.data_len(),
            });
        }
        let old = self.tail_start;
        self.tail_start -= n;
        Ok(old)
    }

    /// Copies `src` to the start of the head region.
    pub fn put_head(&mut self, src: &[u8]) -> Result<(), BufferError> {
        if src.len() > self.head_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: src.len(),
                available: self.head_len(),
            });
        }
        self.storage[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copies `src` to the start of the payload.
    pub fn put(&mut self, src: &[u8]) -> Result<(), BufferError> {
        if src.len() > self.data_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: src.len(),
                available: self.data_len(),
            });
        }
        let start = self.data_start;
        self.storage[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copies `src` to the start of the tail region.
    pub fn put_tail(&mut self, src: &[u8]) -> Result<(), BufferError> {
        if src.len() > self.tail_len() {
            tls::set_last_error(crate::error::ErrorKind::Overflow);
            return Err(BufferError::Overflow {
                requested: src.len(),
                available: self.tail_len(),
            });
        }
        let start = self.tail_start;
        self.storage[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Changes `true_len`, preserving `head_len` and `data_len`. The
    /// caller must ensure the payload still fits when shrinking.
    pub fn realloc(&mut self, new_size: usize) -> Result<(), BufferError> {
        self.storage.resize(new_size, 0);
        self.tail_start = self.tail_start.min(new_size);
        self.data_start = self.data_start.min(self.tail_start);
        Ok(())
    }

    /// Ensures `data_len >= min_data`, growing the tail in place if
    /// possible, else reallocating.
    pub fn enlarge(&mut self, min_data: usize) -> Result<(), BufferError> {
        if min_data <= self.data_len() {
            return Ok(());
        }
        let needed = min_data - self.data_len();
        if needed > self.tail_len() {
            let grow = needed - self.tail_len();
            self.realloc(self.true_len() + grow)?;
        }
        self.pull_tail(needed)?;
        Ok(())
    }

    /// Grows capacity by `n` and extends `data_len` by `n`, preserving
    /// tail contents (the tail slides forward).
    pub fn append(&mut self, n: usize) -> Result<(), BufferError> {
        let old_tail_start = self.tail_start;
        let old_true_len = self.storage.len();
        self.storage.resize(old_true_len + n, 0);
        self.storage.copy_within(old_tail_start..old_true_len, old_tail_start + n);
        self.tail_start = old_tail_start + n;
        Ok(())
    }

    /// A new buffer of size `data_len`, containing only the payload.
    pub fn copy(&self) -> Buffer {
        let mut out = Buffer::alloc_sized(self.data_len());
        out.storage.copy_from_slice(self.data());
        out
    }

    /// A new buffer of size `true_len`, containing the full region with
    /// identical offsets. Named `clone_buffer` to avoid colliding with
    /// `Clone::clone`.
    pub fn clone_buffer(&self) -> Buffer {
        Buffer {
            storage: self.storage.clone(),
            data_start: self.data_start,
            tail_start: self.tail_start,
        }
    }

    /// Detaches the backing memory, leaving `self` an empty, zero-length
    /// shell. The caller owns the returned bytes.
    pub fn steal(&mut self) -> Vec<u8> {
        self.data_start = 0;
        self.tail_start = 0;
        std::mem::take(&mut self.storage)
    }

    /// Equivalent to `steal` followed by dropping the result: releases
    /// the backing store and leaves `self` ready for re-use.
    pub fn purge(&mut self) {
        let _ = self.steal();
    }

    /// Moves the data region to the head boundary (`data_start = 0`)
    /// without touching `tail_len` accounting.
    pub fn start(&mut self) {
        self.data_start = 0;
    }

    /// Moves the end of the data region to the tail boundary
    /// (`tail_start = true_len`), claiming the whole reserve.
    pub fn end(&mut self) {
        self.tail_start = self.storage.len();
    }

    /// Scans the payload (never head or tail) for `byte`. On a hit,
    /// advances `data_start` to the hit and returns the new `data_start`.
    /// On a miss, leaves the buffer unmodified and returns `None`.
    ///
    /// The original C implementation's reverse-scan branch has a
    /// non-terminating loop condition; this is a defect in the source,
    /// not behavior to reproduce. A single
    /// `memchr`/`memrchr` call terminates correctly in either direction.
    pub fn strchr(&mut self, byte: u8, from_front: bool) -> Option<usize> {
        let payload = self.data();
        let hit = if from_front {
            memchr::memchr(byte, payload)
        } else {
            memchr::memrchr(byte, payload)
        };
        hit.map(|i| {
            self.data_start += i;
            self.data_start
        })
    }

    /// Byte-equality of the two buffers' payloads.
    pub fn equal(&self, other: &Buffer) -> bool {
        self.data() == other.data()
    }

    /// Byte-equality of this buffer's payload against `src`.
    pub fn memcmp(&self, src: &[u8]) -> bool {
        self.data() == src
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_buffer_cursor_scenario() {
        let mut buf = Buffer::alloc_sized(32);
        assert!(buf.push(10).is_err());

        buf.pull(10).unwrap();
        assert_eq!(buf.data_len(), 22);
        assert_eq!(buf.head_len(), 10);

        let header = b"ABCDEFGHIJ";
        buf.put_head(header).unwrap();

        let mut expected = Buffer::alloc(10);
        expected.pull_tail(10).unwrap();
        expected.put(header).unwrap();

        let mut head_only = Buffer::alloc_sized(10);
        head_only.storage.copy_from_slice(&buf.storage[..10]);
        assert!(head_only.equal(&expected));

        buf.clear();
        assert_eq!(buf.data_len(), 0);
        assert_eq!(buf.head_len(), 0);
        assert!(buf.storage.iter().all(|&b| b == 0));
    }

    #[test]
    fn pull_push_round_trip() {
        let mut buf = Buffer::alloc_sized(16);
        let before = buf.data_len();
        buf.pull(4).unwrap();
        buf.push(4).unwrap();
        assert_eq!(buf.data_len(), before);
    }

    #[test]
    fn clone_buffer_matches_source() {
        let mut buf = Buffer::alloc(20);
        buf.pull_tail(5).unwrap();
        buf.pull(2).unwrap();
        let cloned = buf.clone_buffer();
        assert_eq!(cloned.true_len(), buf.true_len());
        assert_eq!(cloned.head_len(), buf.head_len());
        assert_eq!(cloned.data_len(), buf.data_len());
        assert_eq!(cloned.tail_len(), buf.tail_len());
        assert_eq!(cloned.storage, buf.storage);
    }

    #[test]
    fn put_overflow_is_rejected() {
        let mut buf = Buffer::alloc(4);
        let err = buf.put(b"12345").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Overflow);
    }

    #[test]
    fn strchr_scans_payload_only_and_terminates_on_miss() {
        let mut buf = Buffer::alloc_sized(8);
        buf.put(b"ab-cd-ef").unwrap();
        assert_eq!(buf.strchr(b'-', true), Some(2));
        assert_eq!(buf.data_len(), 6);

        let mut buf2 = Buffer::alloc_sized(8);
        buf2.put(b"ab-cd-ef").unwrap();
        assert_eq!(buf2.strchr(b'-', false), Some(5));

        let mut buf3 = Buffer::alloc_sized(4);
        buf3.put(b"abcd").unwrap();
        assert_eq!(buf3.strchr(b'z', true), None);
        assert_eq!(buf3.strchr(b'z', false), None);
        assert_eq!(buf3.data_len(), 4);
    }

    #[test]
    fn append_preserves_tail_contents() {
        let mut buf = Buffer::alloc_sized(4);
        buf.put(b"data").unwrap();
        buf.append(4).unwrap();
        assert_eq!(buf.true_len(), 8);
        assert_eq!(buf.data_len(), 8);
        assert_eq!(&buf.data()[..4], b"data");
    }

    #[test]
    fn steal_leaves_empty_shell() {
        let mut buf = Buffer::alloc_sized(10);
        let bytes = buf.steal();
        assert_eq!(bytes.len(), 10);
        assert_eq!(buf.true_len(), 0);
        assert_eq!(buf.data_len(), 0);
    }

    #[test]
    fn enlarge_grows_without_losing_data() {
        let mut buf = Buffer::alloc(4);
        buf.put_tail(b"ab").unwrap();
        buf.pull_tail(2).unwrap();
        buf.enlarge(10).unwrap();
        assert!(buf.data_len() >= 10);
        assert_eq!(&buf.data()[..2], b"ab");
    }
}
