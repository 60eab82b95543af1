// Wire protocol framing: tags, the 5-byte envelope and the reassembled message

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Envelope size: 1 tag byte + Int32 length.
pub const ENVELOPE_LEN: usize = 5;

/// Size of the length field, which counts itself.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Maximum allowed payload size (100MB). Anything larger is treated as a desync.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// A complete ReadyForQuery message: 'Z', Int32(5), status byte.
pub const READY_FOR_QUERY_LEN: usize = 6;

pub const TAG_QUERY: u8 = b'Q';
pub const TAG_PARSE: u8 = b'P';
pub const TAG_BIND: u8 = b'B';
pub const TAG_DESCRIBE: u8 = b'D';
pub const TAG_READY_FOR_QUERY: u8 = b'Z';
pub const TAG_COMMAND_COMPLETE: u8 = b'C';
pub const TAG_COMMAND_COMPLETE_PARTIAL: u8 = b's';
pub const TAG_ERROR: u8 = b'E';

/// Tags a server may put first in a message. Used to decide whether an
/// outbound payload starts on a message boundary.
pub const BACKEND_TAGS: &[u8] = b"123ACDEGHIKNRSTVWZcdnstv";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Incomplete header: only {available} bytes available")]
    IncompleteHeader { available: usize },
    #[error("Invalid message length: {0}")]
    InvalidLength(u32),
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("Truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

/// One-byte message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Query,
    Parse,
    Bind,
    Describe,
    CommandComplete,
    CommandCompletePartial,
    Error,
    ReadyForQuery,
    Other(u8),
}

impl Tag {
    pub fn from_byte(b: u8) -> Self {
        match b {
            TAG_QUERY => Tag::Query,
            TAG_PARSE => Tag::Parse,
            TAG_BIND => Tag::Bind,
            TAG_DESCRIBE => Tag::Describe,
            TAG_COMMAND_COMPLETE => Tag::CommandComplete,
            TAG_COMMAND_COMPLETE_PARTIAL => Tag::CommandCompletePartial,
            TAG_ERROR => Tag::Error,
            TAG_READY_FOR_QUERY => Tag::ReadyForQuery,
            other => Tag::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Tag::Query => TAG_QUERY,
            Tag::Parse => TAG_PARSE,
            Tag::Bind => TAG_BIND,
            Tag::Describe => TAG_DESCRIBE,
            Tag::CommandComplete => TAG_COMMAND_COMPLETE,
            Tag::CommandCompletePartial => TAG_COMMAND_COMPLETE_PARTIAL,
            Tag::Error => TAG_ERROR,
            Tag::ReadyForQuery => TAG_READY_FOR_QUERY,
            Tag::Other(b) => b,
        }
    }

    /// Query and Parse open a new top-level statement.
    pub fn begins_statement(self) -> bool {
        matches!(self, Tag::Query | Tag::Parse)
    }

    pub fn is_completion(self) -> bool {
        matches!(self, Tag::CommandComplete | Tag::CommandCompletePartial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Inbound,
    /// Server to client.
    Outbound,
}

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,          // 'I'
    InTransaction, // 'T'
    Failed,        // 'E'
}

impl TransactionStatus {
    /// Matches a complete 6-byte ReadyForQuery message.
    pub fn from_trailer(trailer: &[u8]) -> Option<Self> {
        match trailer {
            [TAG_READY_FOR_QUERY, 0, 0, 0, 5, b'I'] => Some(TransactionStatus::Idle),
            [TAG_READY_FOR_QUERY, 0, 0, 0, 5, b'T'] => Some(TransactionStatus::InTransaction),
            [TAG_READY_FOR_QUERY, 0, 0, 0, 5, b'E'] => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub tag: Tag,
    pub payload_len: usize,
}

/// Read one envelope at `offset`. Returns the envelope and the offset of its payload.
pub fn read_envelope(buf: &[u8], offset: usize) -> Result<(Envelope, usize), ProtocolError> {
    let available = buf.len().saturating_sub(offset);
    if available < ENVELOPE_LEN {
        return Err(ProtocolError::IncompleteHeader { available });
    }
    let tag = Tag::from_byte(buf[offset]);
    let payload_len = payload_len_at(buf, offset + 1)?;
    Ok((Envelope { tag, payload_len }, offset + ENVELOPE_LEN))
}

/// Decode the Int32 length field at `pos` into a payload length.
pub(crate) fn payload_len_at(buf: &[u8], pos: usize) -> Result<usize, ProtocolError> {
    let field = buf
        .get(pos..pos + LENGTH_FIELD_LEN)
        .ok_or(ProtocolError::IncompleteHeader { available: buf.len().saturating_sub(pos) })?;
    let length = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
    let payload_len = length
        .checked_sub(LENGTH_FIELD_LEN as u32)
        .ok_or(ProtocolError::InvalidLength(length))? as usize;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload_len));
    }
    Ok(payload_len)
}

/// One protocol unit, possibly still being reassembled.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub tag: Tag,
    pub contents: BytesMut,
    pub remaining: usize,
    pub direction: Direction,
}

impl Message {
    /// Start a message whose payload has not arrived yet.
    pub fn pending(envelope: Envelope, direction: Direction) -> Self {
        // Header lengths come off the wire; don't trust them for allocation.
        let capacity = envelope.payload_len.min(64 * 1024);
        Self {
            tag: envelope.tag,
            contents: BytesMut::with_capacity(capacity),
            remaining: envelope.payload_len,
            direction,
        }
    }

    pub fn complete(tag: Tag, contents: &[u8], direction: Direction) -> Self {
        Self {
            tag,
            contents: BytesMut::from(contents),
            remaining: 0,
            direction,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Append up to `remaining` bytes from `data`; returns how many were taken.
    pub fn absorb(&mut self, data: &[u8]) -> usize {
        let take = self.remaining.min(data.len());
        self.contents.put_slice(&data[..take]);
        self.remaining -= take;
        take
    }

    /// Lossy text view of the payload.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents).into_owned()
    }
}

/// Read a null-terminated string starting at `pos`.
pub(crate) fn read_cstring(buf: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    let start = *pos;
    let Some(len) = buf.get(start..).and_then(|rest| rest.iter().position(|&b| b == 0)) else {
        return Err(ProtocolError::InvalidFormat("Missing null terminator".into()));
    };
    *pos = start + len + 1;
    Ok(String::from_utf8_lossy(&buf[start..start + len]).into_owned())
}

/// Statement text carried by a Query or Parse payload.
///
/// Query is `String\0`; Parse is `name\0 query\0 Int16 n [Int32 oid]*`.
/// Malformed payloads fall back to the raw lossy text.
pub fn statement_text(tag: Tag, contents: &[u8]) -> String {
    let mut pos = 0;
    let parsed = match tag {
        Tag::Query => read_cstring(contents, &mut pos),
        Tag::Parse => read_cstring(contents, &mut pos).and_then(|_name| read_cstring(contents, &mut pos)),
        _ => Err(ProtocolError::InvalidFormat("not a statement".into())),
    };
    parsed.unwrap_or_else(|_| String::from_utf8_lossy(contents).into_owned())
}
