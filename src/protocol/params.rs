// Bound parameter decoding for Bind payloads

use bytes::{Buf, Bytes};
use std::fmt;

use super::messages::ProtocolError;

/// Wire length marking a SQL NULL parameter.
const NULL_LENGTH: i32 = -1;

/// One positional parameter value, kept as the raw wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Null,
    Value(Bytes),
}

impl ParamValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ParamValue::Null => None,
            ParamValue::Value(b) => Some(&b[..]),
        }
    }

    /// Text rendering without coercion: UTF-8 values verbatim, anything else as
    /// PostgreSQL bytea hex (`\x...`). NULL has no text.
    pub fn to_text(&self) -> Option<String> {
        let bytes = self.as_bytes()?;
        Some(match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => format!("\\x{}", hex::encode(bytes)),
        })
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated { needed, available: buf.remaining() });
    }
    Ok(())
}

/// Decode the parameter block of a Bind payload.
///
/// Layout as read here: two zero bytes, Int32 count, then `[Int32 len, bytes]*`.
/// The leading zero bytes are the empty portal and statement names of an
/// unnamed Bind; anything else is not treated as a parameter block and
/// yields an empty list. Either every declared parameter is returned or an
/// error is.
pub fn decode_parameters(payload: &[u8]) -> Result<Vec<ParamValue>, ProtocolError> {
    let mut buf = payload;

    ensure(buf, 2)?;
    let prefix = buf.get_u16();
    if prefix != 0 {
        return Ok(Vec::new());
    }

    ensure(buf, 4)?;
    let count = buf.get_i32();
    if count < 0 {
        return Err(ProtocolError::InvalidFormat(format!("negative parameter count {}", count)));
    }
    if count == 0 {
        return Ok(Vec::new());
    }

    // Each parameter needs at least its length field.
    ensure(buf, count as usize * 4)?;
    let mut params = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ensure(buf, 4)?;
        let len = buf.get_i32();
        if len == NULL_LENGTH {
            params.push(ParamValue::Null);
            continue;
        }
        if len < 0 {
            return Err(ProtocolError::InvalidFormat(format!("invalid parameter length {}", len)));
        }
        let len = len as usize;
        ensure(buf, len)?;
        params.push(ParamValue::Value(Bytes::copy_from_slice(&buf[..len])));
        buf.advance(len);
    }
    Ok(params)
}
