//! Codec for transport-layer messages.
//!
//! FRAME and FRAGMENT payloads extend to the end of the batch, so either is
//! the last transport message of its batch by construction.

use crate::codec::core::{
    decode_sized_zid, decode_slice, decode_zint, encode_sized_zid, encode_slice, encode_zint,
    skip_extensions,
};
use crate::codec::{has_flag, mid, network, FLAG_Z};
use crate::core::{PeerId, WhatAmI};
use crate::iobuf::{WBuf, ZBuf};
use crate::msg::transport::*;
use crate::{ProtoError, Result};

/// Transport message ids.
pub mod tmid {
    pub const SCOUT: u8 = 0x01;
    pub const HELLO: u8 = 0x02;
    pub const INIT: u8 = 0x03;
    pub const OPEN: u8 = 0x04;
    pub const CLOSE: u8 = 0x05;
    pub const KEEP_ALIVE: u8 = 0x06;
    pub const FRAME: u8 = 0x07;
    pub const FRAGMENT: u8 = 0x08;
    pub const JOIN: u8 = 0x09;
}

/// INIT/OPEN: this message acknowledges (answers) its counterpart.
pub const FLAG_A: u8 = 0x20;
/// FRAME/FRAGMENT: reliable channel.
pub const FLAG_R: u8 = 0x20;
/// FRAGMENT: more fragments follow.
pub const FLAG_M: u8 = 0x40;

fn reliability_flag(r: Reliability) -> u8 {
    match r {
        Reliability::Reliable => FLAG_R,
        Reliability::BestEffort => 0,
    }
}

fn decode_reliability(header: u8) -> Reliability {
    if has_flag(header, FLAG_R) {
        Reliability::Reliable
    } else {
        Reliability::BestEffort
    }
}

fn decode_whatami_zid(r: &mut ZBuf) -> Result<(PeerId, WhatAmI)> {
    let (zid, low) = decode_sized_zid(r)?;
    let whatami = WhatAmI::from_bits(low).ok_or(ProtoError::ParseBytes)?;
    Ok((zid, whatami))
}

pub fn encode(w: &mut WBuf, msg: &TransportMessage) -> Result<()> {
    match msg {
        TransportMessage::Init(m) => {
            w.write_u8(tmid::INIT | if m.ack { FLAG_A } else { 0 })?;
            w.write_u8(m.version)?;
            encode_sized_zid(w, &m.zid, m.whatami.to_bits())?;
            encode_zint(w, m.sn_resolution)?;
            w.write_u16_le(m.batch_size)?;
            if m.ack {
                encode_slice(w, &m.cookie)?;
            }
            Ok(())
        }
        TransportMessage::Open(m) => {
            w.write_u8(tmid::OPEN | if m.ack { FLAG_A } else { 0 })?;
            encode_zint(w, m.lease_ms)?;
            encode_zint(w, m.initial_sn)?;
            if !m.ack {
                encode_slice(w, &m.cookie)?;
            }
            Ok(())
        }
        TransportMessage::Close(m) => {
            w.write_u8(tmid::CLOSE)?;
            w.write_u8(m.reason)
        }
        TransportMessage::KeepAlive(_) => w.write_u8(tmid::KEEP_ALIVE),
        TransportMessage::Frame(m) => {
            w.write_u8(tmid::FRAME | reliability_flag(m.reliability))?;
            encode_zint(w, m.sn)?;
            for n in &m.payload {
                network::encode(w, n)?;
            }
            Ok(())
        }
        TransportMessage::Fragment(m) => {
            let mut header = tmid::FRAGMENT | reliability_flag(m.reliability);
            if m.more {
                header |= FLAG_M;
            }
            w.write_u8(header)?;
            encode_zint(w, m.sn)?;
            w.write_bytes(&m.payload)
        }
        TransportMessage::Join(m) => {
            w.write_u8(tmid::JOIN)?;
            w.write_u8(m.version)?;
            encode_sized_zid(w, &m.zid, m.whatami.to_bits())?;
            encode_zint(w, m.sn_resolution)?;
            w.write_u16_le(m.batch_size)?;
            encode_zint(w, m.lease_ms)?;
            encode_zint(w, m.next_sn_reliable)?;
            encode_zint(w, m.next_sn_best_effort)
        }
    }
}

pub fn decode(r: &mut ZBuf) -> Result<TransportMessage> {
    let header = r.read_u8().ok_or(ProtoError::ParseBytes)?;
    match mid(header) {
        tmid::INIT => {
            let ack = has_flag(header, FLAG_A);
            let version = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let (zid, whatami) = decode_whatami_zid(r)?;
            let sn_resolution = decode_zint(r)?;
            let batch_size = r.read_u16_le().ok_or(ProtoError::ParseBytes)?;
            let cookie = if ack {
                decode_slice(r)?
            } else {
                Default::default()
            };
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(TransportMessage::Init(Init {
                ack,
                version,
                whatami,
                zid,
                sn_resolution,
                batch_size,
                cookie,
            }))
        }
        tmid::OPEN => {
            let ack = has_flag(header, FLAG_A);
            let lease_ms = decode_zint(r)?;
            let initial_sn = decode_zint(r)?;
            let cookie = if !ack {
                decode_slice(r)?
            } else {
                Default::default()
            };
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(TransportMessage::Open(Open {
                ack,
                lease_ms,
                initial_sn,
                cookie,
            }))
        }
        tmid::CLOSE => {
            let reason = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(TransportMessage::Close(Close { reason }))
        }
        tmid::KEEP_ALIVE => {
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(TransportMessage::KeepAlive(KeepAlive))
        }
        tmid::FRAME => {
            let reliability = decode_reliability(header);
            let sn = decode_zint(r)?;
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            let mut payload = Vec::new();
            while r.can_read() {
                payload.push(network::decode(r)?);
            }
            Ok(TransportMessage::Frame(Frame {
                reliability,
                sn,
                payload,
            }))
        }
        tmid::FRAGMENT => {
            let reliability = decode_reliability(header);
            let more = has_flag(header, FLAG_M);
            let sn = decode_zint(r)?;
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            let payload = r.read_all();
            Ok(TransportMessage::Fragment(Fragment {
                reliability,
                sn,
                more,
                payload,
            }))
        }
        tmid::JOIN => {
            let version = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let (zid, whatami) = decode_whatami_zid(r)?;
            let sn_resolution = decode_zint(r)?;
            let batch_size = r.read_u16_le().ok_or(ProtoError::ParseBytes)?;
            let lease_ms = decode_zint(r)?;
            let next_sn_reliable = decode_zint(r)?;
            let next_sn_best_effort = decode_zint(r)?;
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(TransportMessage::Join(Join {
                version,
                whatami,
                zid,
                sn_resolution,
                batch_size,
                lease_ms,
                next_sn_reliable,
                next_sn_best_effort,
            }))
        }
        other => Err(ProtoError::MessageUnknown(other)),
    }
}
