//! Codec for network-layer messages and their payload sub-messages.

use crate::codec::core::{
    decode_encoding, decode_extensions, decode_slice, decode_string, decode_zint_u16,
    decode_zint_u32, encode_encoding, encode_ext_bytes, encode_ext_zint, encode_slice,
    encode_string, encode_zint, skip_extensions, ExtBody,
};
use crate::codec::{declare, has_flag, mid, FLAG_Z};
use crate::core::{CongestionControl, QoS};
use crate::iobuf::{WBuf, ZBuf};
use crate::msg::network::*;
use crate::{ProtoError, Result};

/// Network message ids.
pub mod nmid {
    pub const PUSH: u8 = 0x00;
    pub const REQUEST: u8 = 0x01;
    pub const RESPONSE: u8 = 0x02;
    pub const RESPONSE_FINAL: u8 = 0x03;
    pub const DECLARE: u8 = 0x04;
    pub const INTEREST: u8 = 0x05;
}

/// Payload sub-message ids.
pub mod zmid {
    pub const PUT: u8 = 0x01;
    pub const DEL: u8 = 0x02;
    pub const QUERY: u8 = 0x03;
    pub const REPLY: u8 = 0x04;
    pub const ERR: u8 = 0x05;
}

/// Suffix present.
pub const FLAG_N: u8 = 0x20;
/// Scope id minted by the receiver.
pub const FLAG_M: u8 = 0x40;
/// Interest id present (DECLARE only).
pub const FLAG_I: u8 = 0x20;

/// Timestamp present (sub-messages).
pub const FLAG_T: u8 = 0x20;
/// Encoding present (PUT/REPLY).
pub const FLAG_E: u8 = 0x40;
/// Parameters present (QUERY).
pub const FLAG_P: u8 = 0x20;
/// Body present (QUERY).
pub const FLAG_B: u8 = 0x40;

/// Extension ids.
const EXT_QOS: u8 = 0x01;
const EXT_ATTACHMENT: u8 = 0x03;

// ── Wire key expressions ──────────────────────────────────────────────────────

pub(crate) fn key_flags(ke: &WireKeyExpr) -> u8 {
    let mut f = 0;
    if ke.has_suffix() {
        f |= FLAG_N;
    }
    if ke.mapping == Mapping::Receiver {
        f |= FLAG_M;
    }
    f
}

pub(crate) fn encode_keyexpr(w: &mut WBuf, ke: &WireKeyExpr) -> Result<()> {
    encode_zint(w, u64::from(ke.scope))?;
    if ke.has_suffix() {
        encode_string(w, &ke.suffix)?;
    }
    Ok(())
}

pub(crate) fn decode_keyexpr(r: &mut ZBuf, header: u8) -> Result<WireKeyExpr> {
    let scope = decode_zint_u16(r)?;
    let suffix = if has_flag(header, FLAG_N) {
        decode_string(r).map_err(|_| ProtoError::ParseKeyExpr)?
    } else {
        String::new()
    };
    let mapping = if has_flag(header, FLAG_M) {
        Mapping::Receiver
    } else {
        Mapping::Sender
    };
    Ok(WireKeyExpr {
        scope,
        suffix,
        mapping,
    })
}

// ── QoS extension ─────────────────────────────────────────────────────────────

fn qos_to_zint(qos: &QoS) -> u64 {
    u64::from(qos.priority & 0x07)
        | (u64::from(qos.congestion == CongestionControl::Block) << 3)
        | (u64::from(qos.express) << 4)
}

fn qos_from_zint(v: u64) -> QoS {
    QoS {
        priority: (v & 0x07) as u8,
        congestion: if v & (1 << 3) != 0 {
            CongestionControl::Block
        } else {
            CongestionControl::Drop
        },
        express: v & (1 << 4) != 0,
    }
}

fn encode_qos_ext(w: &mut WBuf, qos: &QoS) -> Result<()> {
    encode_ext_zint(w, EXT_QOS, false, qos_to_zint(qos))
}

/// Decode the extension chain of a network message, understanding QoS.
fn decode_network_exts(r: &mut ZBuf) -> Result<QoS> {
    let mut qos = QoS::default();
    decode_extensions(r, |id, body| match (id, body) {
        (EXT_QOS, ExtBody::ZInt(v)) => {
            qos = qos_from_zint(v);
            true
        }
        _ => false,
    })?;
    Ok(qos)
}

// ── Payload sub-messages ──────────────────────────────────────────────────────

fn encode_put(w: &mut WBuf, m: &Put) -> Result<()> {
    let mut header = zmid::PUT;
    if m.timestamp.is_some() {
        header |= FLAG_T;
    }
    if !m.encoding.is_empty() {
        header |= FLAG_E;
    }
    if m.attachment.is_some() {
        header |= FLAG_Z;
    }
    w.write_u8(header)?;
    if let Some(ts) = &m.timestamp {
        super::core::encode_timestamp(w, ts)?;
    }
    if !m.encoding.is_empty() {
        encode_encoding(w, &m.encoding)?;
    }
    if let Some(att) = &m.attachment {
        encode_ext_bytes(w, EXT_ATTACHMENT, false, att)?;
    }
    encode_slice(w, &m.payload)
}

fn decode_put(r: &mut ZBuf, header: u8) -> Result<Put> {
    let timestamp = if has_flag(header, FLAG_T) {
        Some(super::core::decode_timestamp(r)?)
    } else {
        None
    };
    let encoding = if has_flag(header, FLAG_E) {
        decode_encoding(r)?
    } else {
        Default::default()
    };
    let mut attachment = None;
    if has_flag(header, FLAG_Z) {
        decode_extensions(r, |id, body| match (id, body) {
            (EXT_ATTACHMENT, ExtBody::Bytes(b)) => {
                attachment = Some(b);
                true
            }
            _ => false,
        })?;
    }
    let payload = decode_slice(r)?;
    Ok(Put {
        timestamp,
        encoding,
        payload,
        attachment,
    })
}

fn encode_del(w: &mut WBuf, m: &Del) -> Result<()> {
    let mut header = zmid::DEL;
    if m.timestamp.is_some() {
        header |= FLAG_T;
    }
    w.write_u8(header)?;
    if let Some(ts) = &m.timestamp {
        super::core::encode_timestamp(w, ts)?;
    }
    Ok(())
}

fn decode_del(r: &mut ZBuf, header: u8) -> Result<Del> {
    let timestamp = if has_flag(header, FLAG_T) {
        Some(super::core::decode_timestamp(r)?)
    } else {
        None
    };
    if has_flag(header, FLAG_Z) {
        skip_extensions(r)?;
    }
    Ok(Del { timestamp })
}

fn encode_query(w: &mut WBuf, m: &Query) -> Result<()> {
    let mut header = zmid::QUERY;
    if !m.parameters.is_empty() {
        header |= FLAG_P;
    }
    if m.body.is_some() {
        header |= FLAG_B;
    }
    if m.attachment.is_some() {
        header |= FLAG_Z;
    }
    w.write_u8(header)?;
    if !m.parameters.is_empty() {
        encode_string(w, &m.parameters)?;
    }
    if let Some(att) = &m.attachment {
        encode_ext_bytes(w, EXT_ATTACHMENT, false, att)?;
    }
    if let Some(body) = &m.body {
        encode_encoding(w, &body.encoding)?;
        encode_slice(w, &body.payload)?;
    }
    Ok(())
}

fn decode_query(r: &mut ZBuf, header: u8) -> Result<Query> {
    let parameters = if has_flag(header, FLAG_P) {
        decode_string(r)?
    } else {
        String::new()
    };
    let mut attachment = None;
    if has_flag(header, FLAG_Z) {
        decode_extensions(r, |id, body| match (id, body) {
            (EXT_ATTACHMENT, ExtBody::Bytes(b)) => {
                attachment = Some(b);
                true
            }
            _ => false,
        })?;
    }
    let body = if has_flag(header, FLAG_B) {
        Some(QueryBody {
            encoding: decode_encoding(r)?,
            payload: decode_slice(r)?,
        })
    } else {
        None
    };
    Ok(Query {
        parameters,
        body,
        attachment,
    })
}

fn encode_reply(w: &mut WBuf, m: &Reply) -> Result<()> {
    let mut header = zmid::REPLY;
    if m.timestamp.is_some() {
        header |= FLAG_T;
    }
    if !m.encoding.is_empty() {
        header |= FLAG_E;
    }
    if m.attachment.is_some() {
        header |= FLAG_Z;
    }
    w.write_u8(header)?;
    if let Some(ts) = &m.timestamp {
        super::core::encode_timestamp(w, ts)?;
    }
    if !m.encoding.is_empty() {
        encode_encoding(w, &m.encoding)?;
    }
    if let Some(att) = &m.attachment {
        encode_ext_bytes(w, EXT_ATTACHMENT, false, att)?;
    }
    encode_slice(w, &m.payload)
}

fn decode_reply(r: &mut ZBuf, header: u8) -> Result<Reply> {
    let timestamp = if has_flag(header, FLAG_T) {
        Some(super::core::decode_timestamp(r)?)
    } else {
        None
    };
    let encoding = if has_flag(header, FLAG_E) {
        decode_encoding(r)?
    } else {
        Default::default()
    };
    let mut attachment = None;
    if has_flag(header, FLAG_Z) {
        decode_extensions(r, |id, body| match (id, body) {
            (EXT_ATTACHMENT, ExtBody::Bytes(b)) => {
                attachment = Some(b);
                true
            }
            _ => false,
        })?;
    }
    let payload = decode_slice(r)?;
    Ok(Reply {
        timestamp,
        encoding,
        payload,
        attachment,
    })
}

fn encode_err(w: &mut WBuf, m: &ReplyErr) -> Result<()> {
    w.write_u8(zmid::ERR)?;
    encode_zint(w, u64::from(m.code))?;
    encode_slice(w, &m.payload)
}

fn decode_err(r: &mut ZBuf, header: u8) -> Result<ReplyErr> {
    let code = decode_zint_u16(r)?;
    if has_flag(header, FLAG_Z) {
        skip_extensions(r)?;
    }
    let payload = decode_slice(r)?;
    Ok(ReplyErr { code, payload })
}

// ── Network messages ──────────────────────────────────────────────────────────

pub fn encode(w: &mut WBuf, msg: &NetworkMessage) -> Result<()> {
    match msg {
        NetworkMessage::Push(m) => {
            let mut header = nmid::PUSH | key_flags(&m.key);
            if m.qos != QoS::default() {
                header |= FLAG_Z;
            }
            w.write_u8(header)?;
            encode_keyexpr(w, &m.key)?;
            if m.qos != QoS::default() {
                encode_qos_ext(w, &m.qos)?;
            }
            match &m.body {
                PushBody::Put(p) => encode_put(w, p),
                PushBody::Del(d) => encode_del(w, d),
            }
        }
        NetworkMessage::Request(m) => {
            let mut header = nmid::REQUEST | key_flags(&m.key);
            if m.qos != QoS::default() {
                header |= FLAG_Z;
            }
            w.write_u8(header)?;
            encode_zint(w, u64::from(m.id))?;
            encode_keyexpr(w, &m.key)?;
            if m.qos != QoS::default() {
                encode_qos_ext(w, &m.qos)?;
            }
            match &m.body {
                RequestBody::Query(q) => encode_query(w, q),
            }
        }
        NetworkMessage::Response(m) => {
            let mut header = nmid::RESPONSE | key_flags(&m.key);
            if m.qos != QoS::default() {
                header |= FLAG_Z;
            }
            w.write_u8(header)?;
            encode_zint(w, u64::from(m.id))?;
            encode_keyexpr(w, &m.key)?;
            if m.qos != QoS::default() {
                encode_qos_ext(w, &m.qos)?;
            }
            match &m.body {
                ResponseBody::Reply(rp) => encode_reply(w, rp),
                ResponseBody::Err(e) => encode_err(w, e),
            }
        }
        NetworkMessage::ResponseFinal(m) => {
            w.write_u8(nmid::RESPONSE_FINAL)?;
            encode_zint(w, u64::from(m.id))
        }
        NetworkMessage::Declare(m) => {
            let mut header = nmid::DECLARE;
            if m.interest_id.is_some() {
                header |= FLAG_I;
            }
            w.write_u8(header)?;
            if let Some(id) = m.interest_id {
                encode_zint(w, u64::from(id))?;
            }
            declare::encode(w, &m.declaration)
        }
        NetworkMessage::Interest(m) => {
            let mut header = nmid::INTEREST;
            if let Some(key) = &m.key {
                header |= key_flags(key);
            }
            w.write_u8(header)?;
            encode_zint(w, u64::from(m.id))?;
            w.write_u8(m.options.0)?;
            if let Some(key) = &m.key {
                encode_keyexpr(w, key)?;
            }
            Ok(())
        }
    }
}

pub fn decode(r: &mut ZBuf) -> Result<NetworkMessage> {
    let header = r.read_u8().ok_or(ProtoError::ParseBytes)?;
    match mid(header) {
        nmid::PUSH => {
            let key = decode_keyexpr(r, header)?;
            let qos = if has_flag(header, FLAG_Z) {
                decode_network_exts(r)?
            } else {
                QoS::default()
            };
            let sub = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let body = match mid(sub) {
                zmid::PUT => PushBody::Put(decode_put(r, sub)?),
                zmid::DEL => PushBody::Del(decode_del(r, sub)?),
                other => return Err(ProtoError::MessageUnknown(other)),
            };
            Ok(NetworkMessage::Push(Push { key, qos, body }))
        }
        nmid::REQUEST => {
            let id = decode_zint_u32(r)?;
            let key = decode_keyexpr(r, header)?;
            let qos = if has_flag(header, FLAG_Z) {
                decode_network_exts(r)?
            } else {
                QoS::default()
            };
            let sub = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let body = match mid(sub) {
                zmid::QUERY => RequestBody::Query(decode_query(r, sub)?),
                other => return Err(ProtoError::MessageUnknown(other)),
            };
            Ok(NetworkMessage::Request(Request { id, key, qos, body }))
        }
        nmid::RESPONSE => {
            let id = decode_zint_u32(r)?;
            let key = decode_keyexpr(r, header)?;
            let qos = if has_flag(header, FLAG_Z) {
                decode_network_exts(r)?
            } else {
                QoS::default()
            };
            let sub = r.read_u8().ok_or(ProtoError::ParseBytes)?;
            let body = match mid(sub) {
                zmid::REPLY => ResponseBody::Reply(decode_reply(r, sub)?),
                zmid::ERR => ResponseBody::Err(decode_err(r, sub)?),
                other => return Err(ProtoError::MessageUnknown(other)),
            };
            Ok(NetworkMessage::Response(Response { id, key, qos, body }))
        }
        nmid::RESPONSE_FINAL => {
            let id = decode_zint_u32(r)?;
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(NetworkMessage::ResponseFinal(ResponseFinal { id }))
        }
        nmid::DECLARE => {
            let interest_id = if has_flag(header, FLAG_I) {
                Some(decode_zint_u32(r)?)
            } else {
                None
            };
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            let declaration = declare::decode(r)?;
            Ok(NetworkMessage::Declare(SessionDeclare {
                interest_id,
                declaration,
            }))
        }
        nmid::INTEREST => {
            let id = decode_zint_u32(r)?;
            let options = InterestOptions(r.read_u8().ok_or(ProtoError::ParseBytes)?);
            let key = if options.contains(InterestOptions::RESTRICTED) {
                Some(decode_keyexpr(r, header)?)
            } else {
                None
            };
            if has_flag(header, FLAG_Z) {
                skip_extensions(r)?;
            }
            Ok(NetworkMessage::Interest(InterestMsg { id, options, key }))
        }
        other => Err(ProtoError::MessageUnknown(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Timestamp;
    use crate::PeerId;
    use bytes::Bytes;

    fn round_trip(msg: NetworkMessage) {
        let mut w = WBuf::fixed(1024);
        encode(&mut w, &msg).unwrap();
        let mut r = ZBuf::new(Bytes::copy_from_slice(w.as_slice()));
        let decoded = decode(&mut r).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(r.remaining(), 0, "decoder left trailing bytes");
    }

    #[test]
    fn push_put_round_trips() {
        round_trip(NetworkMessage::Push(Push {
            key: WireKeyExpr::from_str("demo/example/a"),
            qos: QoS::default(),
            body: PushBody::Put(Put {
                timestamp: None,
                encoding: Default::default(),
                payload: Bytes::from_static(b"hi"),
                attachment: None,
            }),
        }));
    }

    #[test]
    fn push_with_everything_round_trips() {
        round_trip(NetworkMessage::Push(Push {
            key: WireKeyExpr {
                scope: 7,
                suffix: "x".into(),
                mapping: Mapping::Receiver,
            },
            qos: QoS {
                priority: 2,
                congestion: CongestionControl::Block,
                express: true,
            },
            body: PushBody::Put(Put {
                timestamp: Some(Timestamp {
                    time: 123456,
                    id: PeerId::from_slice(&[1, 2, 3]).unwrap(),
                }),
                encoding: crate::core::Encoding {
                    prefix: 4,
                    suffix: Bytes::from_static(b"json"),
                },
                payload: Bytes::from(vec![0xab; 100]),
                attachment: Some(Bytes::from_static(b"meta")),
            }),
        }));
    }

    #[test]
    fn push_del_round_trips() {
        round_trip(NetworkMessage::Push(Push {
            key: WireKeyExpr::scoped(3, ""),
            qos: QoS::default(),
            body: PushBody::Del(Del { timestamp: None }),
        }));
    }

    #[test]
    fn request_query_round_trips() {
        round_trip(NetworkMessage::Request(Request {
            id: 42,
            key: WireKeyExpr::from_str("service/echo"),
            qos: QoS::default(),
            body: RequestBody::Query(Query {
                parameters: "arg=1".into(),
                body: Some(QueryBody {
                    encoding: Default::default(),
                    payload: Bytes::from_static(b"ping"),
                }),
                attachment: None,
            }),
        }));
    }

    #[test]
    fn response_reply_and_err_round_trip() {
        round_trip(NetworkMessage::Response(Response {
            id: 42,
            key: WireKeyExpr::from_str("service/echo"),
            qos: QoS::default(),
            body: ResponseBody::Reply(Reply {
                timestamp: None,
                encoding: Default::default(),
                payload: Bytes::from_static(b"pong"),
                attachment: None,
            }),
        }));
        round_trip(NetworkMessage::Response(Response {
            id: 43,
            key: WireKeyExpr::from_str("service/echo"),
            qos: QoS::default(),
            body: ResponseBody::Err(ReplyErr {
                code: 500,
                payload: Bytes::from_static(b"boom"),
            }),
        }));
        round_trip(NetworkMessage::ResponseFinal(ResponseFinal { id: 42 }));
    }

    #[test]
    fn interest_round_trips() {
        round_trip(NetworkMessage::Interest(InterestMsg {
            id: 9,
            options: InterestOptions(
                InterestOptions::TOKENS
                    | InterestOptions::CURRENT
                    | InterestOptions::FUTURE
                    | InterestOptions::RESTRICTED,
            ),
            key: Some(WireKeyExpr::from_str("alive/**")),
        }));
        round_trip(NetworkMessage::Interest(InterestMsg {
            id: 10,
            options: InterestOptions(InterestOptions::SUBSCRIBERS | InterestOptions::CURRENT),
            key: None,
        }));
    }

    #[test]
    fn declare_with_interest_id_round_trips() {
        round_trip(NetworkMessage::Declare(SessionDeclare {
            interest_id: Some(5),
            declaration: crate::msg::Declaration::Final,
        }));
    }

    #[test]
    fn qos_zint_covers_all_fields() {
        let qos = QoS {
            priority: 7,
            congestion: CongestionControl::Block,
            express: true,
        };
        assert_eq!(qos_from_zint(qos_to_zint(&qos)), qos);
    }
}
