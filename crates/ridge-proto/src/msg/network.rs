//! Network-layer messages, carried inside FRAMEs.

use bytes::Bytes;

use crate::core::{Encoding, QoS, Timestamp};
use crate::msg::declare::Declaration;

/// Who minted the numeric scope id of a wire key expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mapping {
    /// The sender of the message minted the id; the receiver resolves it
    /// against the mapping it learned from that peer's DECL_KEYEXPR.
    #[default]
    Sender,
    /// The receiver minted the id; it resolves against its own table.
    Receiver,
}

/// A key expression as it travels on the wire: an optional numeric scope id
/// plus an optional textual suffix.
///
/// `scope == 0` means "no mapping, the suffix is the whole key". The suffix
/// is a raw string, not necessarily canonical on its own; only the expanded
/// concatenation must canonize.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireKeyExpr {
    pub scope: u16,
    pub suffix: String,
    pub mapping: Mapping,
}

impl WireKeyExpr {
    pub fn from_str(suffix: impl Into<String>) -> Self {
        Self {
            scope: 0,
            suffix: suffix.into(),
            mapping: Mapping::Sender,
        }
    }

    pub fn scoped(scope: u16, suffix: impl Into<String>) -> Self {
        Self {
            scope,
            suffix: suffix.into(),
            mapping: Mapping::Sender,
        }
    }

    pub fn has_suffix(&self) -> bool {
        !self.suffix.is_empty()
    }
}

/// PUT — assert a value for a key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Put {
    pub timestamp: Option<Timestamp>,
    pub encoding: Encoding,
    pub payload: Bytes,
    pub attachment: Option<Bytes>,
}

/// DEL — retract the value for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Del {
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushBody {
    Put(Put),
    Del(Del),
}

/// PUSH — fire-and-forget data towards matching subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub key: WireKeyExpr,
    pub qos: QoS,
    pub body: PushBody,
}

/// The value part of a query or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBody {
    pub encoding: Encoding,
    pub payload: Bytes,
}

/// QUERY — ask every matching queryable for a reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub parameters: String,
    pub body: Option<QueryBody>,
    pub attachment: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Query(Query),
}

/// REQUEST — a correlated ask; answered by RESPONSE / RESPONSE_FINAL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u32,
    pub key: WireKeyExpr,
    pub qos: QoS,
    pub body: RequestBody,
}

/// REPLY — one answer to a REQUEST.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub timestamp: Option<Timestamp>,
    pub encoding: Encoding,
    pub payload: Bytes,
    pub attachment: Option<Bytes>,
}

/// ERR — a failed answer to a REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyErr {
    pub code: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Reply(Reply),
    Err(ReplyErr),
}

/// RESPONSE — carries one reply for a pending request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub key: WireKeyExpr,
    pub qos: QoS,
    pub body: ResponseBody,
}

/// RESPONSE_FINAL — no more responses will follow for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFinal {
    pub id: u32,
}

/// DECLARE — a declaration, optionally routed to a specific interest.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDeclare {
    pub interest_id: Option<u32>,
    pub declaration: Declaration,
}

/// Option bits of an INTEREST message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestOptions(pub u8);

impl InterestOptions {
    pub const KEYEXPRS: u8 = 1 << 0;
    pub const SUBSCRIBERS: u8 = 1 << 1;
    pub const QUERYABLES: u8 = 1 << 2;
    pub const TOKENS: u8 = 1 << 3;
    /// Replay currently matching declarations on receipt.
    pub const CURRENT: u8 = 1 << 4;
    /// Keep forwarding matching declarations as they happen.
    pub const FUTURE: u8 = 1 << 5;
    pub const AGGREGATE: u8 = 1 << 6;
    /// A key expression restricts the interest.
    pub const RESTRICTED: u8 = 1 << 7;

    pub fn tokens_current_future() -> Self {
        Self(Self::TOKENS | Self::CURRENT | Self::FUTURE)
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// INTEREST — subscribe to (re)declarations matching a key.
#[derive(Debug, Clone, PartialEq)]
pub struct InterestMsg {
    pub id: u32,
    pub options: InterestOptions,
    /// Present iff `options` has `RESTRICTED`.
    pub key: Option<WireKeyExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Push(Push),
    Request(Request),
    Response(Response),
    ResponseFinal(ResponseFinal),
    Declare(SessionDeclare),
    Interest(InterestMsg),
}
