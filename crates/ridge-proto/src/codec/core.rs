//! Primitive encodings: variable-length integers, slices, strings,
//! identifiers, timestamps, encodings, and the extension machinery.

use bytes::Bytes;

use crate::core::{Encoding, PeerId, Timestamp};
use crate::iobuf::{WBuf, ZBuf};
use crate::{ProtoError, Result};

// ── Variable-length integers ──────────────────────────────────────────────────

/// Base-128 little-endian with continuation MSB. At most 10 bytes for a
/// 64-bit value; exactly one byte for zero.
pub fn encode_zint(w: &mut WBuf, mut v: u64) -> Result<()> {
    while v > 0x7f {
        w.write_u8(((v & 0x7f) as u8) | 0x80)?;
        v >>= 7;
    }
    w.write_u8(v as u8)
}

pub fn decode_zint(r: &mut ZBuf) -> Result<u64> {
    let mut v: u64 = 0;
    let mut i: u32 = 0;
    loop {
        let b = r.read_u8().ok_or(ProtoError::ParseVle)?;
        // The 10th byte may only contribute bit 63.
        if i == 9 && b > 0x01 {
            return Err(ProtoError::ParseVle);
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b <= 0x7f {
            return Ok(v);
        }
        i += 1;
        if i == 10 {
            return Err(ProtoError::ParseVle);
        }
    }
}

pub fn decode_zint_u32(r: &mut ZBuf) -> Result<u32> {
    u32::try_from(decode_zint(r)?).map_err(|_| ProtoError::ParseVle)
}

pub fn decode_zint_u16(r: &mut ZBuf) -> Result<u16> {
    u16::try_from(decode_zint(r)?).map_err(|_| ProtoError::ParseVle)
}

pub fn decode_zint_usize(r: &mut ZBuf) -> Result<usize> {
    usize::try_from(decode_zint(r)?).map_err(|_| ProtoError::ParseVle)
}

// ── Slices & strings ──────────────────────────────────────────────────────────

/// Length-prefixed byte slice.
pub fn encode_slice(w: &mut WBuf, bytes: &[u8]) -> Result<()> {
    encode_zint(w, bytes.len() as u64)?;
    w.write_bytes(bytes)
}

/// Decoded slices alias the input buffer; the caller must copy anything it
/// keeps past the batch's lifetime.
pub fn decode_slice(r: &mut ZBuf) -> Result<Bytes> {
    let n = decode_zint_usize(r)?;
    r.read_exact(n).ok_or(ProtoError::ParseBytes)
}

pub fn encode_string(w: &mut WBuf, s: &str) -> Result<()> {
    encode_slice(w, s.as_bytes())
}

pub fn decode_string(r: &mut ZBuf) -> Result<String> {
    let bytes = decode_slice(r).map_err(|_| ProtoError::ParseString)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::ParseString)
}

// ── Peer identifiers ──────────────────────────────────────────────────────────

/// A peer id prefixed by a combined size byte: `((len - 1) << 4) | low`,
/// where `low` is a caller-supplied nibble (the node role, in practice).
pub fn encode_sized_zid(w: &mut WBuf, zid: &PeerId, low: u8) -> Result<()> {
    debug_assert!(low <= 0x0f);
    w.write_u8((((zid.len() - 1) as u8) << 4) | (low & 0x0f))?;
    w.write_bytes(zid.as_slice())
}

pub fn decode_sized_zid(r: &mut ZBuf) -> Result<(PeerId, u8)> {
    let sized = r.read_u8().ok_or(ProtoError::ParseBytes)?;
    let len = ((sized >> 4) as usize) + 1;
    let bytes = r.read_exact(len).ok_or(ProtoError::ParseBytes)?;
    let zid = PeerId::from_slice(&bytes).ok_or(ProtoError::ParseBytes)?;
    Ok((zid, sized & 0x0f))
}

// ── Timestamps ────────────────────────────────────────────────────────────────

pub fn encode_timestamp(w: &mut WBuf, ts: &Timestamp) -> Result<()> {
    encode_zint(w, ts.time)?;
    encode_slice(w, ts.id.as_slice())
}

pub fn decode_timestamp(r: &mut ZBuf) -> Result<Timestamp> {
    let time = decode_zint(r).map_err(|_| ProtoError::ParseTimestamp)?;
    let id = decode_slice(r).map_err(|_| ProtoError::ParseTimestamp)?;
    let id = PeerId::from_slice(&id).ok_or(ProtoError::ParseTimestamp)?;
    Ok(Timestamp { time, id })
}

// ── Encodings ─────────────────────────────────────────────────────────────────

/// `(prefix << 1 | S)` as VLE, followed by the suffix bytes when `S`.
pub fn encode_encoding(w: &mut WBuf, en: &Encoding) -> Result<()> {
    let has_suffix = !en.suffix.is_empty();
    encode_zint(w, (u64::from(en.prefix) << 1) | u64::from(has_suffix))?;
    if has_suffix {
        encode_slice(w, &en.suffix)?;
    }
    Ok(())
}

pub fn decode_encoding(r: &mut ZBuf) -> Result<Encoding> {
    let v = decode_zint(r)?;
    let prefix = u16::try_from(v >> 1).map_err(|_| ProtoError::ParseVle)?;
    let suffix = if v & 1 != 0 {
        decode_slice(r)?
    } else {
        Bytes::new()
    };
    Ok(Encoding { prefix, suffix })
}

// ── Extensions ────────────────────────────────────────────────────────────────

/// Extension header layout: `MORE | SHAPE | ID`. Ids with [`ext::MANDATORY`]
/// set must be understood; others are skippable.
pub mod ext {
    pub const MORE: u8 = 0x80;
    pub const SHAPE_MASK: u8 = 0x60;
    pub const SHAPE_UNIT: u8 = 0x00;
    pub const SHAPE_ZINT: u8 = 0x20;
    pub const SHAPE_BYTES: u8 = 0x40;
    pub const SHAPE_MESSAGE: u8 = 0x60;
    pub const ID_MASK: u8 = 0x1F;
    pub const MANDATORY: u8 = 0x10;
}

/// A decoded extension body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtBody {
    Unit,
    ZInt(u64),
    Bytes(Bytes),
}

/// Decode an extension chain. `handle` returns whether it understood the
/// extension; a mandatory extension nobody understands fails the message.
pub fn decode_extensions(
    r: &mut ZBuf,
    mut handle: impl FnMut(u8, ExtBody) -> bool,
) -> Result<()> {
    loop {
        let h = r.read_u8().ok_or(ProtoError::ParseExtension)?;
        let body = match h & ext::SHAPE_MASK {
            ext::SHAPE_UNIT => ExtBody::Unit,
            ext::SHAPE_ZINT => {
                ExtBody::ZInt(decode_zint(r).map_err(|_| ProtoError::ParseExtension)?)
            }
            // Bytes and nested-message shapes are both length-prefixed.
            _ => ExtBody::Bytes(decode_slice(r).map_err(|_| ProtoError::ParseExtension)?),
        };
        let id = h & ext::ID_MASK;
        if !handle(id, body) && id & ext::MANDATORY != 0 {
            return Err(ProtoError::ExtensionMandatory(id));
        }
        if h & ext::MORE == 0 {
            return Ok(());
        }
    }
}

/// Skip an extension chain, failing only on mandatory extensions.
pub fn skip_extensions(r: &mut ZBuf) -> Result<()> {
    decode_extensions(r, |_, _| false)
}

pub fn encode_ext_zint(w: &mut WBuf, id: u8, more: bool, v: u64) -> Result<()> {
    w.write_u8(id | ext::SHAPE_ZINT | if more { ext::MORE } else { 0 })?;
    encode_zint(w, v)
}

pub fn encode_ext_bytes(w: &mut WBuf, id: u8, more: bool, bytes: &[u8]) -> Result<()> {
    w.write_u8(id | ext::SHAPE_BYTES | if more { ext::MORE } else { 0 })?;
    encode_slice(w, bytes)
}
