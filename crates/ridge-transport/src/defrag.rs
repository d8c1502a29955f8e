//! Per-peer, per-channel fragment reassembly.

use bytes::Bytes;

use ridge_proto::iobuf::{WBuf, ZBuf};

use crate::common::sn_increment;
use crate::TransportError;

/// Chunk size of the reassembly chain.
const CHUNK: usize = 4096;

/// Reassembles a run of FRAGMENT payloads with consecutive SNs.
///
/// The buffer is non-empty only between a non-final fragment and either the
/// matching final fragment or a channel reset. Fragment payloads are linked
/// in without copying; they alias the receive batch they arrived in.
pub struct DefragBuffer {
    buf: WBuf,
    /// SN the next fragment must carry, while active.
    expected_sn: Option<u64>,
    /// Max reassembled bytes; 0 = unlimited.
    budget: usize,
}

impl DefragBuffer {
    pub fn new(budget: usize) -> Self {
        Self {
            buf: WBuf::expandable(CHUNK),
            expected_sn: None,
            budget,
        }
    }

    pub fn is_active(&self) -> bool {
        self.expected_sn.is_some()
    }

    /// Append one already-SN-accepted fragment.
    ///
    /// A gap against the expected SN discards the partial message and starts
    /// over from this fragment. Exceeding the budget discards everything and
    /// reports [`TransportError::NoMemory`].
    pub fn push(&mut self, res: u64, sn: u64, payload: Bytes) -> Result<(), TransportError> {
        if let Some(expected) = self.expected_sn {
            if sn != expected {
                tracing::warn!(expected, got = sn, "fragment gap, dropping partial message");
                self.reset();
            }
        }
        self.buf.append(payload)?;
        if self.budget != 0 && self.buf.len() > self.budget {
            self.reset();
            return Err(TransportError::NoMemory);
        }
        self.expected_sn = Some(sn_increment(res, sn));
        Ok(())
    }

    /// Hand over the reassembled bytes and empty the buffer.
    pub fn finalize(&mut self) -> ZBuf {
        self.expected_sn = None;
        std::mem::replace(&mut self.buf, WBuf::expandable(CHUNK)).to_zbuf()
    }

    pub fn reset(&mut self) {
        self.expected_sn = None;
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_fragments_reassemble() {
        let mut d = DefragBuffer::new(0);
        d.push(16, 3, Bytes::from_static(b"hello ")).unwrap();
        d.push(16, 4, Bytes::from_static(b"world")).unwrap();
        let mut z = d.finalize();
        assert_eq!(z.read_all().as_ref(), b"hello world");
        assert!(!d.is_active());
    }

    #[test]
    fn gap_discards_partial_message() {
        let mut d = DefragBuffer::new(0);
        d.push(16, 3, Bytes::from_static(b"old")).unwrap();
        // SN 5 is not the expected 4: the stale prefix must go.
        d.push(16, 5, Bytes::from_static(b"new")).unwrap();
        let mut z = d.finalize();
        assert_eq!(z.read_all().as_ref(), b"new");
    }

    #[test]
    fn budget_overflow_resets_and_reports() {
        let mut d = DefragBuffer::new(8);
        d.push(16, 0, Bytes::from_static(b"123456")).unwrap();
        assert!(matches!(
            d.push(16, 1, Bytes::from_static(b"789")),
            Err(TransportError::NoMemory)
        ));
        assert!(!d.is_active());
        assert_eq!(d.finalize().remaining(), 0);
    }

    #[test]
    fn sn_wraps_inside_a_fragment_run() {
        let mut d = DefragBuffer::new(0);
        d.push(16, 15, Bytes::from_static(b"a")).unwrap();
        d.push(16, 0, Bytes::from_static(b"b")).unwrap();
        let mut z = d.finalize();
        assert_eq!(z.read_all().as_ref(), b"ab");
    }
}
