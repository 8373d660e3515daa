//! Binary frame header for vproto.
//!
//! Frame layout (16-byte header + payload, all fields little-endian):
//!
//! ```text
//! +--------+---------+----------+--------------+----------+
//! | magic  | version | reserved | payload size | sequence |
//! | 4 bytes| 2 bytes | 2 bytes  |   4 bytes    | 4 bytes  |
//! +--------+---------+----------+--------------+----------+
//! | payload: payload-size bytes                           |
//! +-------------------------------------------------------+
//! ```
//!
//! The reserved field is zero on send and ignored on receive. Replies echo
//! the request sequence.

use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, MIN_COMPAT_VERSION, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, BytesMut};

/// Magic constant identifying vproto frames.
pub const MAGIC: u32 = 0xEEDD1132;

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's protocol version.
    pub version: u16,
    /// Byte count of the payload that follows the header.
    pub payload_len: u32,
    /// Request sequence; echoed by the server on replies.
    pub seq: u32,
}

impl Header {
    /// Appends a 16-byte header for an outbound frame.
    pub fn encode(payload_len: u32, seq: u32, buf: &mut BytesMut) {
        buf.put_u32_le(MAGIC);
        buf.put_u16_le(PROTOCOL_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(payload_len);
        buf.put_u32_le(seq);
    }

    /// Decodes and validates a header read off the wire.
    ///
    /// `max_seq` is the connection's sequence bound (`pipeline depth *`
    /// [`crate::SEQ_SPAN`]); a reply sequence at or past it can never match
    /// a slot and is a protocol violation.
    pub fn decode(raw: &[u8; FRAME_HEADER_SIZE], max_seq: u32) -> Result<Self, ProtocolError> {
        let mut buf = &raw[..];

        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = buf.get_u16_le();
        if version < MIN_COMPAT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        // Reserved field: ignored on receive.
        let _ = buf.get_u16_le();

        let payload_len = buf.get_u32_le();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let seq = buf.get_u32_le();
        if !crate::seq_is_valid(seq, max_seq) {
            return Err(ProtocolError::InvalidSequence(seq));
        }

        Ok(Self {
            version,
            payload_len,
            seq,
        })
    }
}
