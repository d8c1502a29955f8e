//! Errors that can arise when interpreting wire-format data.

/// Decode and buffer errors for the Ridge wire format.
///
/// Parse variants carry no payload on purpose: a failed decode drops the
/// whole batch, so the only consumer of the detail is the log line at the
/// point of failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("failed to decode variable-length integer")]
    ParseVle,

    #[error("not enough bytes to read slice")]
    ParseBytes,

    #[error("string is not valid utf-8")]
    ParseString,

    #[error("key expression is malformed")]
    ParseKeyExpr,

    #[error("failed to decode timestamp")]
    ParseTimestamp,

    #[error("failed to decode extension block")]
    ParseExtension,

    #[error("unknown message id: 0x{0:02x}")]
    MessageUnknown(u8),

    #[error("unknown mandatory extension: 0x{0:02x}")]
    ExtensionMandatory(u8),

    #[error("key expression is not canonical: {0}")]
    KeyExprNotCanonical(&'static str),

    #[error("write buffer is full")]
    Full,
}
