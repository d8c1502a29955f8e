//! Core protocol types shared by every layer.
//!
//! These types ARE the protocol's data model. Field widths and wire
//! representations are fixed; changing anything here is a breaking change
//! for every peer on the network.

use bytes::Bytes;

use crate::keyexpr::KeyExpr;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current protocol version, exchanged in SCOUT/HELLO/INIT/JOIN.
pub const PROTOCOL_VERSION: u8 = 0x09;

/// Default sequence-number resolution: SNs live in `[0, 2^28)`.
pub const DEFAULT_SN_RESOLUTION: u64 = 1 << 28;

/// Default maximum batch size in bytes. Also the hard ceiling for stream
/// links, whose batches are prefixed by a little-endian u16 length.
pub const DEFAULT_BATCH_SIZE: u16 = u16::MAX;

/// Default lease in milliseconds. A peer silent for a whole lease is dead.
pub const DEFAULT_LEASE_MS: u64 = 10_000;

/// Keepalives (and lease ticks) run at `lease / LEASE_KEEPALIVE_FACTOR`.
pub const LEASE_KEEPALIVE_FACTOR: u32 = 4;

/// Default multicast locator used for scouting and JOIN exchange.
pub const DEFAULT_SCOUT_LOCATOR: &str = "udp/224.0.0.224:7446";

// ── Peer identity ─────────────────────────────────────────────────────────────

/// Unique peer identifier — 1 to 16 bytes, little-endian.
///
/// Trailing zero bytes are trimmed on the wire; two ids are equal iff their
/// trimmed byte content is equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    bytes: [u8; 16],
    len: u8,
}

impl PeerId {
    pub const MAX_LEN: usize = 16;

    /// Generate a fresh random 16-byte id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        // A zero last byte would be trimmed on the wire and change the length;
        // force it non-zero so the id is stable across a round-trip.
        if bytes[15] == 0 {
            bytes[15] = 1;
        }
        Self { bytes, len: 16 }
    }

    /// Build from raw little-endian bytes, trimming trailing zeros.
    /// Returns `None` for empty or oversized input.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.is_empty() || slice.len() > Self::MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes[..slice.len()].copy_from_slice(slice);
        let mut len = slice.len();
        while len > 1 && bytes[len - 1] == 0 {
            len -= 1;
        }
        Some(Self {
            bytes,
            len: len as u8,
        })
    }

    /// The trimmed wire bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.as_slice()))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

// ── Node role ─────────────────────────────────────────────────────────────────

/// The role of a node, exchanged during scouting and session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WhatAmI {
    Router = 0b00,
    Peer = 0b01,
    Client = 0b10,
}

impl WhatAmI {
    /// Decode from the low two bits of a wire byte. 0b11 is reserved.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b00 => Some(WhatAmI::Router),
            0b01 => Some(WhatAmI::Peer),
            0b10 => Some(WhatAmI::Client),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        self as u8
    }

    /// This role's bit in a scouting `what` mask.
    pub fn mask_bit(self) -> u8 {
        match self {
            WhatAmI::Router => what::ROUTER,
            WhatAmI::Peer => what::PEER,
            WhatAmI::Client => what::CLIENT,
        }
    }
}

/// Bits of the scouting `what` mask: which roles a scout is looking for.
pub mod what {
    pub const ROUTER: u8 = 1 << 0;
    pub const PEER: u8 = 1 << 1;
    pub const CLIENT: u8 = 1 << 2;
}

// ── Timestamp ─────────────────────────────────────────────────────────────────

/// Opaque 64-bit time plus the id of the issuing node.
/// Monotonic per issuer by contract; never interpreted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub time: u64,
    pub id: PeerId,
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// MIME-like payload type: a registered prefix id plus a free-form suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub prefix: u16,
    pub suffix: Bytes,
}

impl Encoding {
    pub const EMPTY: u16 = 0;

    pub fn empty() -> Self {
        Self {
            prefix: Self::EMPTY,
            suffix: Bytes::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix == Self::EMPTY && self.suffix.is_empty()
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Self::empty()
    }
}

// ── QoS ───────────────────────────────────────────────────────────────────────

/// What to do with a message when the outbound path is congested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    /// Wait for room in the batch. File-transfer style traffic.
    Block,
    /// Discard the message. Telemetry style traffic.
    #[default]
    Drop,
}

/// Per-message quality of service, carried as a network-message extension
/// when it differs from the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QoS {
    /// 0 (highest) ..= 7 (lowest).
    pub priority: u8,
    pub congestion: CongestionControl,
    pub express: bool,
}

impl QoS {
    pub const DEFAULT_PRIORITY: u8 = 5;
}

impl Default for QoS {
    fn default() -> Self {
        Self {
            priority: Self::DEFAULT_PRIORITY,
            congestion: CongestionControl::Drop,
            express: false,
        }
    }
}

// ── Samples ───────────────────────────────────────────────────────────────────

/// Whether a sample asserts or retracts a value for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Put,
    Delete,
}

/// A data sample as delivered to subscription callbacks.
///
/// `payload` and `attachment` may alias the transport's receive buffer for
/// the duration of the callback; callbacks that keep data must copy it.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: KeyExpr,
    pub payload: Bytes,
    pub encoding: Encoding,
    pub kind: SampleKind,
    pub timestamp: Option<Timestamp>,
    pub attachment: Option<Bytes>,
    pub qos: QoS,
}

// ── Close reasons ─────────────────────────────────────────────────────────────

/// Reason codes carried by CLOSE messages.
pub mod close_reason {
    pub const GENERIC: u8 = 0;
    pub const UNSUPPORTED: u8 = 1;
    pub const INVALID: u8 = 2;
    pub const MAX_SESSIONS: u8 = 3;
    pub const MAX_LINKS: u8 = 4;
    pub const EXPIRED: u8 = 5;
    pub const WRITE_ERROR: u8 = 6;
    pub const READ_ERROR: u8 = 7;
    pub const UNKNOWN_MESSAGE: u8 = 8;
    pub const UNKNOWN_EXTENSION: u8 = 9;
    pub const UNKNOWN_CAUSE: u8 = 10;
}
