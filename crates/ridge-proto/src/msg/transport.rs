//! Transport-layer messages: session establishment, liveness, and framing.

use bytes::Bytes;

use crate::core::{PeerId, WhatAmI};
use crate::msg::network::NetworkMessage;

/// Which channel a FRAME or FRAGMENT belongs to. Each channel has its own
/// sequence-number space and defragmentation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    Reliable,
    BestEffort,
}

/// INIT — first two steps of the unicast handshake.
///
/// The opener sends INIT with `ack == false`; the acceptor answers with
/// `ack == true` and a cookie the opener must echo back in OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub ack: bool,
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: PeerId,
    /// Proposed (syn) or granted (ack) sequence-number resolution.
    pub sn_resolution: u64,
    /// Maximum batch the sender is willing to receive.
    pub batch_size: u16,
    /// Present iff `ack`.
    pub cookie: Bytes,
}

/// OPEN — last two steps of the unicast handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    pub ack: bool,
    pub lease_ms: u64,
    pub initial_sn: u64,
    /// Echo of the INIT ack cookie; present iff `!ack`.
    pub cookie: Bytes,
}

/// CLOSE — terminate the session, carrying a `close_reason` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    pub reason: u8,
}

/// KEEP_ALIVE — sent when nothing else was transmitted within a lease tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive;

/// FRAME — a sequenced batch of network messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub reliability: Reliability,
    pub sn: u64,
    pub payload: Vec<NetworkMessage>,
}

/// FRAGMENT — one sequenced slice of an oversized serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub reliability: Reliability,
    pub sn: u64,
    /// Set on every fragment but the last.
    pub more: bool,
    pub payload: Bytes,
}

/// JOIN — periodic multicast announcement of identity and transport
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub version: u8,
    pub whatami: WhatAmI,
    pub zid: PeerId,
    pub sn_resolution: u64,
    pub batch_size: u16,
    pub lease_ms: u64,
    /// The SN this peer will use for its next reliable frame.
    pub next_sn_reliable: u64,
    /// The SN this peer will use for its next best-effort frame.
    pub next_sn_best_effort: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Init(Init),
    Open(Open),
    Close(Close),
    KeepAlive(KeepAlive),
    Frame(Frame),
    Fragment(Fragment),
    Join(Join),
}

impl From<Frame> for TransportMessage {
    fn from(m: Frame) -> Self {
        TransportMessage::Frame(m)
    }
}

impl From<Fragment> for TransportMessage {
    fn from(m: Fragment) -> Self {
        TransportMessage::Fragment(m)
    }
}
