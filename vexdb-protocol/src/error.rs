//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or argument handling.
///
/// All variants are `Clone` so a connection can store one terminal error and
/// hand the same value to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported protocol version: {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("invalid sequence number: {0}")]
    InvalidSequence(u32),

    #[error("unknown argument tag: {0:#04x}")]
    InvalidTag(u8),

    #[error("unknown command code: {0}")]
    InvalidCommand(u16),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("argument nesting too deep")]
    NestingTooDeep,

    #[error("truncated frame")]
    Truncated,
}
