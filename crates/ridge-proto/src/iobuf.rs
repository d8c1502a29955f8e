//! Read and write buffers the codec operates on.
//!
//! [`ZBuf`] is a reader over one or more byte slices with a single read
//! cursor. [`WBuf`] is a writer that is either fixed-capacity (one batch,
//! datagram-sized) or expandable (a chain of chunks, used to stage
//! serialized messages for fragmentation and to reassemble fragments).

use bytes::{Bytes, BytesMut};

use crate::{ProtoError, Result};

// ── ZBuf ──────────────────────────────────────────────────────────────────────

/// A reader over a chained sequence of byte slices.
#[derive(Debug, Clone, Default)]
pub struct ZBuf {
    slices: Vec<Bytes>,
    idx: usize,
    pos: usize,
}

impl ZBuf {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            slices: vec![bytes],
            idx: 0,
            pos: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a slice at the end of the chain without copying.
    pub fn push(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.slices.push(bytes);
        }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        let mut n = 0;
        for (i, s) in self.slices.iter().enumerate().skip(self.idx) {
            n += s.len() - if i == self.idx { self.pos } else { 0 };
        }
        n
    }

    pub fn can_read(&self) -> bool {
        self.remaining() > 0
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        loop {
            let s = self.slices.get(self.idx)?;
            if self.pos < s.len() {
                let b = s[self.pos];
                self.pos += 1;
                return Some(b);
            }
            self.idx += 1;
            self.pos = 0;
        }
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    /// Read exactly `n` bytes. Zero-copy when the request fits in the
    /// current slice; assembled otherwise.
    pub fn read_exact(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if self.remaining() < n {
            return None;
        }
        // Skip any exhausted slices first.
        while self.pos >= self.slices[self.idx].len() {
            self.idx += 1;
            self.pos = 0;
        }
        let s = &self.slices[self.idx];
        if s.len() - self.pos >= n {
            let out = s.slice(self.pos..self.pos + n);
            self.pos += n;
            return Some(out);
        }
        let mut out = BytesMut::with_capacity(n);
        let mut left = n;
        while left > 0 {
            let s = &self.slices[self.idx];
            let take = left.min(s.len() - self.pos);
            out.extend_from_slice(&s[self.pos..self.pos + take]);
            self.pos += take;
            left -= take;
            if self.pos == s.len() && left > 0 {
                self.idx += 1;
                self.pos = 0;
            }
        }
        Some(out.freeze())
    }

    /// Read everything left in the buffer.
    pub fn read_all(&mut self) -> Bytes {
        let n = self.remaining();
        self.read_exact(n).unwrap_or_default()
    }

    /// Reclaim fully-read prefix slices.
    pub fn compact(&mut self) {
        if self.idx > 0 {
            self.slices.drain(..self.idx);
            self.idx = 0;
        }
    }
}

// ── WBuf ──────────────────────────────────────────────────────────────────────

/// Rollback point for [`WBuf::truncate`].
#[derive(Debug, Clone, Copy)]
pub struct WBufMark {
    chunks: usize,
    curr: usize,
}

/// A writer with either a fixed capacity or an expandable chunk chain.
#[derive(Debug)]
pub struct WBuf {
    chunks: Vec<Bytes>,
    curr: Vec<u8>,
    cap: usize,
    expandable: bool,
}

impl WBuf {
    /// One slice of exactly `cap` bytes; writes past it fail with
    /// [`ProtoError::Full`].
    pub fn fixed(cap: usize) -> Self {
        Self {
            chunks: Vec::new(),
            curr: Vec::with_capacity(cap),
            cap,
            expandable: false,
        }
    }

    /// A chain of `chunk_size`-byte slices grown on demand.
    pub fn expandable(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            curr: Vec::with_capacity(chunk_size),
            cap: chunk_size,
            expandable: true,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum::<usize>() + self.curr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_u8(&mut self, b: u8) -> Result<()> {
        if self.curr.len() == self.cap {
            if !self.expandable {
                return Err(ProtoError::Full);
            }
            self.freeze_curr();
        }
        self.curr.push(b);
        Ok(())
    }

    pub fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        if !self.expandable {
            if self.curr.len() + bytes.len() > self.cap {
                return Err(ProtoError::Full);
            }
            self.curr.extend_from_slice(bytes);
            return Ok(());
        }
        while !bytes.is_empty() {
            if self.curr.len() == self.cap {
                self.freeze_curr();
            }
            let take = bytes.len().min(self.cap - self.curr.len());
            self.curr.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        Ok(())
    }

    /// Append a slice to the chain without copying. Falls back to a copy for
    /// fixed buffers, which have a single backing slice.
    pub fn append(&mut self, bytes: Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.expandable {
            return self.write_bytes(&bytes);
        }
        self.freeze_curr();
        self.chunks.push(bytes);
        Ok(())
    }

    /// Move up to `n` bytes from `src` without copying: source slices are
    /// re-linked into this buffer's chain piecewise.
    pub fn siphon(&mut self, src: &mut ZBuf, n: usize) -> Result<usize> {
        let mut left = n.min(src.remaining());
        let moved = left;
        while left > 0 {
            while src.pos >= src.slices[src.idx].len() {
                src.idx += 1;
                src.pos = 0;
            }
            let s = &src.slices[src.idx];
            let take = left.min(s.len() - src.pos);
            let piece = s.slice(src.pos..src.pos + take);
            src.pos += take;
            left -= take;
            self.append(piece)?;
        }
        Ok(moved)
    }

    pub fn mark(&self) -> WBufMark {
        WBufMark {
            chunks: self.chunks.len(),
            curr: self.curr.len(),
        }
    }

    /// Roll back everything written after `mark`. Only valid on fixed
    /// buffers (batch rollback when a message does not fit).
    pub fn truncate(&mut self, mark: WBufMark) {
        self.chunks.truncate(mark.chunks);
        self.curr.truncate(mark.curr);
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.curr.clear();
    }

    /// The written bytes of a fixed buffer, which are always contiguous.
    ///
    /// # Panics
    /// Panics on an expandable buffer that has frozen chunks.
    pub fn as_slice(&self) -> &[u8] {
        assert!(self.chunks.is_empty(), "chained WBuf is not contiguous");
        &self.curr
    }

    /// Convert the written chain into a reader.
    pub fn to_zbuf(mut self) -> ZBuf {
        self.freeze_curr();
        ZBuf {
            slices: self.chunks,
            idx: 0,
            pos: 0,
        }
    }

    fn freeze_curr(&mut self) {
        if !self.curr.is_empty() {
            let chunk = std::mem::replace(&mut self.curr, Vec::with_capacity(self.cap));
            self.chunks.push(Bytes::from(chunk));
        }
    }
}
