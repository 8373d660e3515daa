//! Request and response envelopes.
//!
//! The frame header carries no command field (its reserved slot is zero on
//! send), so a request payload leads with the command code:
//!
//! ```text
//! u16le command | u32le count | tagged args | 0xFF | u32le count | tagged args
//! ```
//!
//! The section after the `0xFF` marker is the args chunk: transport-level
//! metadata appended behind the caller's arguments. It currently carries one
//! Int64, the per-request execution timeout in milliseconds (0 = none),
//! which lets the server tell the client-supplied transport timeout apart
//! from payload arguments.
//!
//! A response payload is a status envelope:
//!
//! ```text
//! i32le status | u32le message len | message bytes | u32le count | tagged args
//! ```

use crate::args::{self, Arg};
use crate::command::CmdCode;
use crate::error::ProtocolError;
use crate::frame::{Header, FRAME_HEADER_SIZE};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, BytesMut};

/// Marker byte opening the args chunk of a request payload.
pub const ARGS_CHUNK_MARKER: u8 = 0xFF;

/// Response status meaning success.
pub const STATUS_OK: i32 = 0;

/// Encodes a complete request frame (header included).
pub fn encode_request(
    cmd: CmdCode,
    seq: u32,
    request_args: &[Arg],
    exec_timeout_ms: i64,
) -> Result<BytesMut, ProtocolError> {
    let mut payload = BytesMut::with_capacity(64);
    payload.put_u16_le(cmd.code());
    args::encode_list(request_args, &mut payload);
    payload.put_u8(ARGS_CHUNK_MARKER);
    args::encode_list(&[Arg::Int64(exec_timeout_ms)], &mut payload);
    frame_up(payload, seq)
}

fn frame_up(payload: BytesMut, seq: u32) -> Result<BytesMut, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len() as u32,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    Header::encode(payload.len() as u32, seq, &mut frame);
    frame.put_slice(&payload);
    Ok(frame)
}

/// A decoded request payload. Used by the server side of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub cmd: CmdCode,
    pub args: Vec<Arg>,
    /// Execution timeout from the args chunk, milliseconds (0 = none).
    pub exec_timeout_ms: i64,
}

impl Request {
    /// Decodes a request payload (the bytes after the frame header).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        if buf.remaining() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let cmd = CmdCode::try_from(buf.get_u16_le())?;
        let request_args = args::decode_list(&mut buf)?;

        let mut exec_timeout_ms = 0;
        if buf.has_remaining() {
            let marker = buf.get_u8();
            if marker != ARGS_CHUNK_MARKER {
                return Err(ProtocolError::InvalidTag(marker));
            }
            let chunk = args::decode_list(&mut buf)?;
            if let Some(Arg::Int64(t)) = chunk.first() {
                exec_timeout_ms = *t;
            }
        }

        Ok(Self {
            cmd,
            args: request_args,
            exec_timeout_ms,
        })
    }
}

/// A decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Server status; [`STATUS_OK`] on success.
    pub status: i32,
    /// Error message accompanying a non-OK status; empty on success.
    pub message: String,
    /// Reply arguments.
    pub args: Vec<Arg>,
}

impl Response {
    /// A successful response carrying the given arguments.
    pub fn ok(args: Vec<Arg>) -> Self {
        Self {
            status: STATUS_OK,
            message: String::new(),
            args,
        }
    }

    /// An error response.
    pub fn error(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            args: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Encodes a complete response frame (header included), echoing `seq`.
    pub fn encode(&self, seq: u32) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::with_capacity(64);
        payload.put_i32_le(self.status);
        payload.put_u32_le(self.message.len() as u32);
        payload.put_slice(self.message.as_bytes());
        args::encode_list(&self.args, &mut payload);
        frame_up(payload, seq)
    }

    /// Decodes a response payload (the bytes after the frame header).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        if buf.remaining() < 8 {
            return Err(ProtocolError::Truncated);
        }
        let status = buf.get_i32_le();
        let msg_len = buf.get_u32_le() as usize;
        if buf.remaining() < msg_len {
            return Err(ProtocolError::Truncated);
        }
        let mut msg = vec![0u8; msg_len];
        buf.copy_to_slice(&mut msg);
        let message = String::from_utf8_lossy(&msg).into_owned();
        let args = args::decode_list(&mut buf)?;

        Ok(Self {
            status,
            message,
            args,
        })
    }
}
