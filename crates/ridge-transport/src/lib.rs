//! ridge-transport — the unicast and multicast transport state machines.
//!
//! A transport owns a link, numbers outbound frames, reassembles inbound
//! fragments, watches peer liveness, and hands every inbound network
//! message to its [`TransportEventHandler`] — the session layer.

pub mod common;
pub mod defrag;
pub mod multicast;
pub mod unicast;

pub use common::{sn_precedes, TransportConfig};
pub use multicast::TransportMulticast;
pub use unicast::TransportUnicast;

use ridge_link::LinkError;
use ridge_proto::msg::NetworkMessage;
use ridge_proto::{PeerId, ProtoError, WhatAmI};

/// Errors raised by transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("protocol version mismatch: local 0x{local:02x}, remote 0x{remote:02x}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("sequence-number resolution mismatch")]
    SnResolutionMismatch,

    #[error("handshake cookie mismatch")]
    CookieMismatch,

    #[error("unexpected message during handshake")]
    MessageUnexpected,

    #[error("transport is closed")]
    Closed,

    #[error("lease expired")]
    Expired,

    #[error("defragmentation budget exceeded")]
    NoMemory,
}

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// CLOSE received, or an orderly local teardown.
    Closed,
    /// Nothing heard for a whole lease.
    Expired,
    /// The link failed.
    Error,
}

/// The session-facing side of a transport.
///
/// Implementations hold the session weakly; a transport outliving its
/// session sees the upgrade fail and drops the event.
pub trait TransportEventHandler: Send + Sync {
    /// One inbound network message from `peer`, in wire order.
    fn handle_message(&self, peer: &PeerId, msg: NetworkMessage);

    /// A new peer appeared (multicast JOIN, or an accepted unicast peer).
    fn peer_connected(&self, peer: &PeerId, whatami: WhatAmI);

    /// A peer went away; the session drops everything attributed to it.
    fn peer_disconnected(&self, peer: &PeerId, reason: DisconnectReason);
}
