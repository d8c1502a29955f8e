//! Codec for declarations.

use crate::codec::core::{
    decode_extensions, decode_string, decode_zint_u16, decode_zint_u32, encode_ext_zint,
    encode_string, encode_zint, skip_extensions, ExtBody,
};
use crate::codec::network::{decode_keyexpr, encode_keyexpr, key_flags, FLAG_M, FLAG_N};
use crate::msg::network::Mapping;
use crate::codec::{has_flag, mid, FLAG_Z};
use crate::iobuf::{WBuf, ZBuf};
use crate::msg::declare::{Declaration, QueryableInfo};
use crate::msg::network::WireKeyExpr;
use crate::{ProtoError, Result};

/// Declaration ids.
pub mod did {
    pub const KEYEXPR: u8 = 0x00;
    pub const UNDECL_KEYEXPR: u8 = 0x01;
    pub const SUBSCRIBER: u8 = 0x02;
    pub const UNDECL_SUBSCRIBER: u8 = 0x03;
    pub const QUERYABLE: u8 = 0x04;
    pub const UNDECL_QUERYABLE: u8 = 0x05;
    pub const TOKEN: u8 = 0x06;
    pub const UNDECL_TOKEN: u8 = 0x07;
    pub const FINAL: u8 = 0x1A;
}

/// Queryable routing info extension.
const EXT_QUERYABLE_INFO: u8 = 0x01;

fn info_to_zint(info: &QueryableInfo) -> u64 {
    u64::from(info.complete) | (u64::from(info.distance) << 1)
}

fn info_from_zint(v: u64) -> QueryableInfo {
    QueryableInfo {
        complete: v & 1 != 0,
        distance: ((v >> 1) & 0xffff) as u16,
    }
}

/// Undeclarations optionally echo the key they refer to; presence is the
/// `N` flag, and the suffix is always length-prefixed (it may be empty).
fn optional_key_flags(key: &Option<WireKeyExpr>) -> u8 {
    match key {
        None => 0,
        Some(ke) => {
            FLAG_N
                | if ke.mapping == Mapping::Receiver {
                    FLAG_M
                } else {
                    0
                }
        }
    }
}

fn encode_optional_key(w: &mut WBuf, key: &Option<WireKeyExpr>) -> Result<()> {
    if let Some(ke) = key {
        encode_zint(w, u64::from(ke.scope))?;
        encode_string(w, &ke.suffix)?;
    }
    Ok(())
}

fn decode_optional_key(r: &mut ZBuf, header: u8) -> Result<Option<WireKeyExpr>> {
    if !has_flag(header, FLAG_N) {
        return Ok(None);
    }
    let scope = decode_zint_u16(r)?;
    let suffix = decode_string(r).map_err(|_| ProtoError::ParseKeyExpr)?;
    let mapping = if has_flag(header, FLAG_M) {
        Mapping::Receiver
    } else {
        Mapping::Sender
    };
    Ok(Some(WireKeyExpr {
        scope,
        suffix,
        mapping,
    }))
}

pub fn encode(w: &mut WBuf, decl: &Declaration) -> Result<()> {
    match decl {
        Declaration::KeyExpr { id, suffix } => {
            w.write_u8(did::KEYEXPR)?;
            encode_zint(w, u64::from(*id))?;
            encode_string(w, suffix)
        }
        Declaration::UndeclKeyExpr { id } => {
            w.write_u8(did::UNDECL_KEYEXPR)?;
            encode_zint(w, u64::from(*id))
        }
        Declaration::Subscriber { id, key } => {
            w.write_u8(did::SUBSCRIBER | key_flags(key))?;
            encode_zint(w, u64::from(*id))?;
            encode_keyexpr(w, key)
        }
        Declaration::UndeclSubscriber { id, key } => {
            w.write_u8(did::UNDECL_SUBSCRIBER | optional_key_flags(key))?;
            encode_zint(w, u64::from(*id))?;
            encode_optional_key(w, key)
        }
        Declaration::Queryable { id, key, info } => {
            let mut header = did::QUERYABLE | key_flags(key);
            if *info != QueryableInfo::default() {
                header |= FLAG_Z;
            }
            w.write_u8(header)?;
            encode_zint(w, u64::from(*id))?;
            encode_keyexpr(w, key)?;
            if *info != QueryableInfo::default() {
                encode_ext_zint(w, EXT_QUERYABLE_INFO, false, info_to_zint(info))?;
            }
            Ok(())
        }
        Declaration::UndeclQueryable { id, key } => {
            w.write_u8(did::UNDECL_QUERYABLE | optional_key_flags(key))?;
            encode_zint(w, u64::from(*id))?;
            encode_optional_key(w, key)
        }
        Declaration::Token { id, key } => {
            w.write_u8(did::TOKEN | key_flags(key))?;
            encode_zint(w, u64::from(*id))?;
            encode_keyexpr(w, key)
        }
        Declaration::UndeclToken { id, key } => {
            w.write_u8(did::UNDECL_TOKEN | optional_key_flags(key))?;
            encode_zint(w, u64::from(*id))?;
            encode_optional_key(w, key)
        }
        Declaration::Final => w.write_u8(did::FINAL),
    }
}

pub fn decode(r: &mut ZBuf) -> Result<Declaration> {
    let header = r.read_u8().ok_or(ProtoError::ParseBytes)?;
    let decl = match mid(header) {
        did::KEYEXPR => Declaration::KeyExpr {
            id: decode_zint_u16(r)?,
            suffix: decode_string(r)?,
        },
        did::UNDECL_KEYEXPR => Declaration::UndeclKeyExpr {
            id: decode_zint_u16(r)?,
        },
        did::SUBSCRIBER => Declaration::Subscriber {
            id: decode_zint_u32(r)?,
            key: decode_keyexpr(r, header)?,
        },
        did::UNDECL_SUBSCRIBER => Declaration::UndeclSubscriber {
            id: decode_zint_u32(r)?,
            key: decode_optional_key(r, header)?,
        },
        did::QUERYABLE => {
            let id = decode_zint_u32(r)?;
            let key = decode_keyexpr(r, header)?;
            let mut info = QueryableInfo::default();
            if has_flag(header, FLAG_Z) {
                decode_extensions(r, |id, body| match (id, body) {
                    (EXT_QUERYABLE_INFO, ExtBody::ZInt(v)) => {
                        info = info_from_zint(v);
                        true
                    }
                    _ => false,
                })?;
            }
            Declaration::Queryable { id, key, info }
        }
        did::UNDECL_QUERYABLE => Declaration::UndeclQueryable {
            id: decode_zint_u32(r)?,
            key: decode_optional_key(r, header)?,
        },
        did::TOKEN => Declaration::Token {
            id: decode_zint_u32(r)?,
            key: decode_keyexpr(r, header)?,
        },
        did::UNDECL_TOKEN => Declaration::UndeclToken {
            id: decode_zint_u32(r)?,
            key: decode_optional_key(r, header)?,
        },
        did::FINAL => {
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Declaration::Final
        }
        other => return Err(ProtoError::MessageUnknown(other)),
    };
    // Declarations with a Z flag we did not consume above carry extensions
    // from a newer peer; skip them.
    match &decl {
        Declaration::Queryable { .. } | Declaration::Final => {}
        _ if has_flag(header, FLAG_Z) => skip_extensions(r)?,
        _ => {}
    }
    Ok(decl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn round_trip(decl: Declaration) {
        let mut w = WBuf::fixed(256);
        encode(&mut w, &decl).unwrap();
        let mut r = ZBuf::new(Bytes::copy_from_slice(w.as_slice()));
        assert_eq!(decode(&mut r).unwrap(), decl);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn keyexpr_declarations_round_trip() {
        round_trip(Declaration::KeyExpr {
            id: 7,
            suffix: "demo/example/".into(),
        });
        round_trip(Declaration::UndeclKeyExpr { id: 7 });
    }

    #[test]
    fn subscriber_declarations_round_trip() {
        round_trip(Declaration::Subscriber {
            id: 1,
            key: WireKeyExpr::from_str("demo/**"),
        });
        round_trip(Declaration::UndeclSubscriber { id: 1, key: None });
        round_trip(Declaration::UndeclSubscriber {
            id: 2,
            key: Some(WireKeyExpr::scoped(7, "x")),
        });
    }

    #[test]
    fn queryable_declarations_round_trip() {
        round_trip(Declaration::Queryable {
            id: 3,
            key: WireKeyExpr::from_str("service/echo"),
            info: QueryableInfo::default(),
        });
        round_trip(Declaration::Queryable {
            id: 4,
            key: WireKeyExpr::from_str("service/*"),
            info: QueryableInfo {
                complete: true,
                distance: 2,
            },
        });
        round_trip(Declaration::UndeclQueryable { id: 3, key: None });
    }

    #[test]
    fn token_declarations_round_trip() {
        round_trip(Declaration::Token {
            id: 5,
            key: WireKeyExpr::from_str("alive/node-1"),
        });
        round_trip(Declaration::UndeclToken {
            id: 5,
            key: Some(WireKeyExpr::from_str("alive/node-1")),
        });
        round_trip(Declaration::Final);
    }

    #[test]
    fn unknown_declaration_id_is_rejected() {
        let mut r = ZBuf::new(Bytes::copy_from_slice(&[0x1B]));
        assert_eq!(decode(&mut r), Err(ProtoError::MessageUnknown(0x1B)));
    }
}
