//! # vexdb-protocol
//!
//! Wire protocol implementation for vexdb (vproto - vexdb binary RPC).
//!
//! This crate provides:
//! - The fixed 16-byte little-endian frame header
//! - The tagged binary argument stream
//! - Request/Response envelope encoding and decoding
//! - Command codes and protocol constants

pub mod args;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;

pub use args::Arg;
pub use codec::{encode_request, Request, Response};
pub use command::CmdCode;
pub use error::ProtocolError;
pub use frame::{Header, FRAME_HEADER_SIZE, MAGIC};

/// Protocol version sent by this implementation.
pub const PROTOCOL_VERSION: u16 = 0x102;

/// Oldest peer version this implementation can talk to.
pub const MIN_COMPAT_VERSION: u16 = 0x101;

/// Default port for vexdb server.
pub const DEFAULT_PORT: u16 = 6590;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Sequence numbers allotted to each pipeline slot.
///
/// A connection with pipeline depth `d` draws sequence numbers from
/// `[0, d * SEQ_SPAN)`; slot index is `seq % d`, so each slot cycles through
/// its own arithmetic progression and a stale reply can never be confused
/// with the slot's current occupant.
pub const SEQ_SPAN: u32 = 10_000_000;

/// Upper bound (exclusive) of the sequence space for a pipeline depth.
///
/// The bound itself doubles as the idle-slot sentinel.
pub fn max_seq(depth: u32) -> u32 {
    depth * SEQ_SPAN
}

/// Returns whether `seq` names a live request for the given sequence bound.
pub fn seq_is_valid(seq: u32, max_seq: u32) -> bool {
    seq < max_seq
}

/// The sequence the slot owning `seq` will carry next.
pub fn next_seq(seq: u32, depth: u32) -> u32 {
    let next = seq + depth;
    if next < max_seq(depth) {
        next
    } else {
        next - max_seq(depth)
    }
}
