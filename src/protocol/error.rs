//! Protocol error types.

use thiserror::Error;

/// Errors related to wire message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message type: 0x{0:02x}")]
    InvalidMessageType(u8),

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("message too long: max {max}, got {got}")]
    MessageTooLong { max: usize, got: usize },

    #[error("unknown instance role: 0x{0:02x}")]
    UnknownRole(u8),

    #[error("invalid envelope kind: 0x{0:02x}")]
    InvalidKind(u8),

    #[error("invalid response status: 0x{0:02x}")]
    InvalidStatus(u8),

    #[error("invalid value type: 0x{0:02x}")]
    InvalidValueType(u8),

    #[error("malformed message: {0}")]
    Malformed(String),
}
