//! Single-shot terminal message search over one server payload.
//!
//! The server's answer to a statement ends with
//! `C <len> <tag text>` followed by `Z 0 0 0 5 <status>`. Instead of walking
//! the whole response from its start (which may lie in an earlier packet),
//! the scanner checks for the ReadyForQuery trailer and walks backwards to the
//! CommandComplete whose declared length lands exactly on that trailer.

use crate::protocol::messages::payload_len_at;
use crate::protocol::{Direction, Message, Tag, TransactionStatus, ENVELOPE_LEN, READY_FOR_QUERY_LEN};

/// Bytes between a CommandComplete's first byte and its contents, plus the
/// trailing ReadyForQuery. A candidate at `i` is consistent when
/// `payload_len == len - i - TERMINAL_OVERHEAD`.
pub const TERMINAL_OVERHEAD: usize = ENVELOPE_LEN + READY_FOR_QUERY_LEN;

/// Find the terminal message of a self-contained server payload.
///
/// An ErrorResponse at the very start wins outright. Otherwise the payload
/// must end in ReadyForQuery and contain a CommandComplete (or the partial
/// variant) whose length ends right before it. Anything else yields `None`.
pub fn scan_response(payload: &[u8]) -> Option<Message> {
    if payload.len() < ENVELOPE_LEN {
        return None;
    }

    if Tag::from_byte(payload[0]) == Tag::Error {
        let payload_len = payload_len_at(payload, 1).ok()?;
        let contents = payload.get(ENVELOPE_LEN..ENVELOPE_LEN + payload_len)?;
        return Some(Message::complete(Tag::Error, contents, Direction::Outbound));
    }

    let len = payload.len();
    if len < READY_FOR_QUERY_LEN {
        return None;
    }
    TransactionStatus::from_trailer(&payload[len - READY_FOR_QUERY_LEN..])?;

    // Positions past len - TERMINAL_OVERHEAD would need a negative payload.
    let last = len.checked_sub(TERMINAL_OVERHEAD)?;
    for i in (0..=last).rev() {
        let tag = Tag::from_byte(payload[i]);
        if !tag.is_completion() {
            continue;
        }
        let Ok(payload_len) = payload_len_at(payload, i + 1) else {
            continue;
        };
        if payload_len == last - i {
            let start = i + ENVELOPE_LEN;
            return Some(Message::complete(tag, &payload[start..start + payload_len], Direction::Outbound));
        }
    }
    None
}
