//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or payload handling.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("package too large: {size} bytes (max {max})")]
    PackageTooLarge { size: usize, max: usize },

    #[error("package too short: {size} bytes (header needs {min})")]
    PackageTooShort { size: usize, min: usize },

    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("{field} too long: {len} bytes (max 255)")]
    CredentialTooLong { field: &'static str, len: usize },

    #[error("truncated credentials block")]
    TruncatedCredentials,

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("payload decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid enum value {value} for {field}")]
    InvalidEnumValue { field: &'static str, value: i32 },
}
