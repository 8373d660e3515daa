//! Tagged binary argument stream.
//!
//! Arguments travel as a `u32` count followed by tagged values: one tag byte,
//! then the value encoding. Strings carry an explicit byte length and no
//! terminator; booleans occupy one byte; null has no payload; tuples nest a
//! full count-prefixed value list.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};

const TAG_INT: u8 = 0;
const TAG_INT64: u8 = 1;
const TAG_DOUBLE: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_NULL: u8 = 5;
const TAG_TUPLE: u8 = 6;

/// Nesting bound for tuple decoding, so a corrupt stream cannot recurse
/// without limit.
const MAX_NESTING: usize = 32;

/// A single protocol argument.
///
/// `String` holds raw bytes: the wire format carries a length-prefixed byte
/// run and makes no UTF-8 promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Int64(i64),
    Double(f64),
    Bool(bool),
    String(Vec<u8>),
    Null,
    Tuple(Vec<Arg>),
}

impl Arg {
    /// Appends the tagged encoding of this value.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Arg::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i32_le(*v);
            }
            Arg::Int64(v) => {
                buf.put_u8(TAG_INT64);
                buf.put_i64_le(*v);
            }
            Arg::Double(v) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64_le(*v);
            }
            Arg::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*v));
            }
            Arg::String(v) => {
                buf.put_u8(TAG_STRING);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v);
            }
            Arg::Null => {
                buf.put_u8(TAG_NULL);
            }
            Arg::Tuple(items) => {
                buf.put_u8(TAG_TUPLE);
                encode_list(items, buf);
            }
        }
    }

    /// Decodes one tagged value.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        decode_value(buf, 0)
    }

    /// The value as an `i64`, when it carries an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(i64::from(*v)),
            Arg::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as UTF-8 text, when it is a string holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }
}

fn need(buf: &&[u8], n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated);
    }
    Ok(())
}

fn decode_value(buf: &mut &[u8], depth: usize) -> Result<Arg, ProtocolError> {
    if depth > MAX_NESTING {
        return Err(ProtocolError::NestingTooDeep);
    }
    need(buf, 1)?;
    let tag = buf.get_u8();
    match tag {
        TAG_INT => {
            need(buf, 4)?;
            Ok(Arg::Int(buf.get_i32_le()))
        }
        TAG_INT64 => {
            need(buf, 8)?;
            Ok(Arg::Int64(buf.get_i64_le()))
        }
        TAG_DOUBLE => {
            need(buf, 8)?;
            Ok(Arg::Double(buf.get_f64_le()))
        }
        TAG_BOOL => {
            need(buf, 1)?;
            Ok(Arg::Bool(buf.get_u8() != 0))
        }
        TAG_STRING => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, len)?;
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            Ok(Arg::String(bytes))
        }
        TAG_NULL => Ok(Arg::Null),
        TAG_TUPLE => {
            need(buf, 4)?;
            let count = buf.get_u32_le() as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(decode_value(buf, depth + 1)?);
            }
            Ok(Arg::Tuple(items))
        }
        other => Err(ProtocolError::InvalidTag(other)),
    }
}

/// Appends a count-prefixed argument list.
pub fn encode_list(args: &[Arg], buf: &mut BytesMut) {
    buf.put_u32_le(args.len() as u32);
    for arg in args {
        arg.encode(buf);
    }
}

/// Decodes a count-prefixed argument list.
pub fn decode_list(buf: &mut &[u8]) -> Result<Vec<Arg>, ProtocolError> {
    need(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    let mut args = Vec::new();
    for _ in 0..count {
        args.push(decode_value(buf, 0)?);
    }
    Ok(args)
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int64(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::String(v.as_bytes().to_vec())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::String(v.into_bytes())
    }
}

impl From<&[u8]> for Arg {
    fn from(v: &[u8]) -> Self {
        Arg::String(v.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::String(v)
    }
}

impl From<&[i32]> for Arg {
    fn from(v: &[i32]) -> Self {
        Arg::Tuple(v.iter().map(|i| Arg::Int(*i)).collect())
    }
}

impl From<Vec<i32>> for Arg {
    fn from(v: Vec<i32>) -> Self {
        Arg::from(v.as_slice())
    }
}
