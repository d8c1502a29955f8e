//! ridge-proto — wire format, key expressions, and IO buffers.
//! All other Ridge crates depend on this one.

pub mod codec;
pub mod core;
pub mod iobuf;
pub mod keyexpr;
pub mod msg;

mod error;

pub use crate::core::{
    CongestionControl, Encoding, PeerId, QoS, Sample, SampleKind, Timestamp, WhatAmI,
};
pub use crate::error::ProtoError;
pub use crate::iobuf::{WBuf, ZBuf};
pub use crate::keyexpr::KeyExpr;

/// Result alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtoError>;
