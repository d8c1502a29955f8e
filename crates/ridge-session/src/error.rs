//! Session-level errors.

use ridge_link::LinkError;
use ridge_proto::ProtoError;
use ridge_transport::TransportError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was closed, locally or by losing its last link.
    #[error("session is closed")]
    Closed,

    #[error("key expression is not canonical")]
    KeyExprNotCanonical,

    /// A wire key referenced a mapping id nobody declared.
    #[error("unknown key expression id: {0}")]
    KeyExprUnknown(u16),

    #[error("unknown entity")]
    EntityUnknown,

    #[error("unknown query")]
    QueryUnknown,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
