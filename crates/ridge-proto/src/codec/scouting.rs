//! Codec for scouting messages.

use crate::codec::core::{decode_sized_zid, decode_string, decode_zint_usize, encode_sized_zid,
    encode_string, encode_zint, skip_extensions};
use crate::codec::transport::tmid;
use crate::codec::{has_flag, mid, FLAG_Z};
use crate::core::WhatAmI;
use crate::iobuf::{WBuf, ZBuf};
use crate::msg::scouting::{Hello, Scout, ScoutingMessage};
use crate::{ProtoError, Result};

/// SCOUT: the scout's own zid is present.
pub const FLAG_I: u8 = 0x20;
/// HELLO: a locator list is present.
pub const FLAG_L: u8 = 0x20;

pub fn encode(w: &mut WBuf, msg: &ScoutingMessage) -> Result<()> {
    match msg {
        ScoutingMessage::Scout(m) => {
            w.write_u8(tmid::SCOUT | if m.zid.is_some() { FLAG_I } else { 0 })?;
            w.write_u8(m.version)?;
            w.write_u8(m.what)?;
            if let Some(zid) = &m.zid {
                encode_sized_zid(w, zid, 0)?;
            }
            Ok(())
        }
        ScoutingMessage::Hello(m) => {
            w.write_u8(tmid::HELLO | if m.locators.is_empty() { 0 } else { FLAG_L })?;
            w.write_u8(m.version)?;
            encode_sized_zid(w, &m.zid, m.whatami.to_bits())?;
            if !m.locators.is_empty() {
                encode_zint(w, m.locators.len() as u64)?;
                for loc in &m.locators {
                    encode_string(w, loc)?;
                }
            }
            Ok(())
        }
    }
}

pub fn decode(r: &mut ZBuf) -> Result<ScoutingMessage> {
    let header = r.read_u8().ok_or(ProtoError::ParseBytes)?;
    match mid(header) {
        tmid::SCOUT => {
            let version = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let what = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let zid = if has_flag(header, FLAG_I) {
                Some(decode_sized_zid(r)?.0)
            } else {
                None
            };
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(ScoutingMessage::Scout(Scout { version, what, zid }))
        }
        tmid::HELLO => {
            let version = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let (zid, low) = decode_sized_zid(r)?;
            let whatami = WhatAmI::from_bits(low).ok_or(ProtoError::ParseBytes)?;
            let locators = if has_flag(header, FLAG_L) {
                let n = decode_zint_usize(r)?;
                // A datagram can only carry so many locators; reject sizes
                // that cannot possibly fit the remaining bytes.
                if n > r.remaining() {
                    return Err(ProtoError::ParseBytes);
                }
                let mut out = Vec::with_capacity(n);
                for _ in 0..n {
                    out.push(decode_string(r)?);
                }
                out
            } else {
                Vec::new()
            };
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(ScoutingMessage::Hello(Hello {
                version,
                whatami,
                zid,
                locators,
            }))
        }
        other => Err(ProtoError::MessageUnknown(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{what, PeerId, PROTOCOL_VERSION};
    use bytes::Bytes;

    fn round_trip(msg: ScoutingMessage) {
        let mut w = WBuf::fixed(512);
        encode(&mut w, &msg).unwrap();
        let mut r = ZBuf::new(Bytes::copy_from_slice(w.as_slice()));
        assert_eq!(decode(&mut r).unwrap(), msg);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn scout_round_trips() {
        round_trip(ScoutingMessage::Scout(Scout {
            version: PROTOCOL_VERSION,
            what: what::ROUTER | what::PEER,
            zid: None,
        }));
        round_trip(ScoutingMessage::Scout(Scout {
            version: PROTOCOL_VERSION,
            what: what::ROUTER,
            zid: Some(PeerId::from_slice(&[9, 9, 9]).unwrap()),
        }));
    }

    #[test]
    fn hello_round_trips() {
        round_trip(ScoutingMessage::Hello(Hello {
            version: PROTOCOL_VERSION,
            whatami: WhatAmI::Router,
            zid: PeerId::from_slice(&[1; 16]).unwrap(),
            locators: vec!["tcp/10.0.0.1:7447".into(), "udp/10.0.0.1:7447".into()],
        }));
        round_trip(ScoutingMessage::Hello(Hello {
            version: PROTOCOL_VERSION,
            whatami: WhatAmI::Peer,
            zid: PeerId::from_slice(&[2]).unwrap(),
            locators: vec![],
        }));
    }

    #[test]
    fn malformed_hello_is_rejected() {
        // Locator count far beyond the datagram size.
        let mut w = WBuf::fixed(64);
        w.write_u8(tmid::HELLO | FLAG_L).unwrap();
        w.write_u8(PROTOCOL_VERSION).unwrap();
        encode_sized_zid(&mut w, &PeerId::from_slice(&[1]).unwrap(), 0).unwrap();
        encode_zint(&mut w, 1_000_000).unwrap();
        let mut r = ZBuf::new(Bytes::copy_from_slice(w.as_slice()));
        assert!(decode(&mut r).is_err());
    }
}
