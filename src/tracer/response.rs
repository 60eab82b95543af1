use std::str::FromStr;

use crate::protocol::messages::BACKEND_TAGS;
use crate::protocol::{Direction, Message, ProtocolError, Tag};

use super::reassembler::StreamReassembler;
use super::scanner::scan_response;

/// How server payloads are turned into terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Every payload is scanned on its own (error first, else completion before ReadyForQuery).
    #[default]
    Scan,
    /// Payloads are reassembled as a stream; the scan is used only while the
    /// stream position is unknown.
    Stream,
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scan" => Ok(ResponseMode::Scan),
            "stream" => Ok(ResponseMode::Stream),
            other => Err(format!("unknown response mode '{}'", other)),
        }
    }
}

/// Picks terminal events out of a stream of complete server messages.
pub trait TerminalPredicate {
    /// Look at the next complete message; return it (or a message remembered
    /// earlier) when it ends the current query.
    fn observe(&mut self, message: Message) -> Option<Message>;

    /// Drop anything remembered from a previous query.
    fn reset(&mut self) {}
}

/// Default predicate: an ErrorResponse ends the query at once; otherwise the
/// last CommandComplete seen is emitted when ReadyForQuery arrives.
#[derive(Debug, Default)]
pub struct CompletionBeforeReady {
    completion: Option<Message>,
}

impl TerminalPredicate for CompletionBeforeReady {
    fn observe(&mut self, message: Message) -> Option<Message> {
        match message.tag {
            Tag::Error => {
                self.completion = None;
                Some(message)
            }
            tag if tag.is_completion() => {
                self.completion = Some(message);
                None
            }
            Tag::ReadyForQuery => self.completion.take(),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.completion = None;
    }
}

/// Per-connection response side: either the stateless scan, or stream
/// reassembly with a [`TerminalPredicate`] and the scan as fallback.
pub struct ResponseAssembler<P = CompletionBeforeReady> {
    mode: ResponseMode,
    stream: StreamReassembler,
    predicate: P,
    synced: bool,
}

impl ResponseAssembler<CompletionBeforeReady> {
    pub fn new(mode: ResponseMode) -> Self {
        Self::with_predicate(mode, CompletionBeforeReady::default())
    }
}

impl<P: TerminalPredicate> ResponseAssembler<P> {
    pub fn with_predicate(mode: ResponseMode, predicate: P) -> Self {
        Self {
            mode,
            stream: StreamReassembler::new(Direction::Outbound),
            predicate,
            synced: false,
        }
    }

    /// Whether stream mode currently trusts its position in the byte stream.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn reset(&mut self) {
        self.stream.reset();
        self.predicate.reset();
        self.synced = false;
    }

    /// Process one server payload; returns the terminal messages it carries, in order.
    pub fn feed(&mut self, payload: &[u8]) -> Vec<Message> {
        match self.mode {
            ResponseMode::Scan => scan_response(payload).into_iter().collect(),
            ResponseMode::Stream => self.feed_stream(payload),
        }
    }

    fn feed_stream(&mut self, payload: &[u8]) -> Vec<Message> {
        if self.stream.is_idle() && !starts_on_boundary(payload) {
            self.synced = false;
            return scan_response(payload).into_iter().collect();
        }

        let mut terminals = Vec::new();
        let predicate = &mut self.predicate;
        let result: Result<(), ProtocolError> = self.stream.feed(payload, |msg| {
            if let Some(terminal) = predicate.observe(msg) {
                terminals.push(terminal);
            }
        });

        match result {
            Ok(()) => {
                self.synced = true;
                terminals
            }
            Err(e) => {
                tracing::debug!("response stream lost sync: {}", e);
                self.reset();
                // Whatever was already found stands; otherwise fall back to the scan.
                if terminals.is_empty() {
                    scan_response(payload).into_iter().collect()
                } else {
                    terminals
                }
            }
        }
    }
}

/// A payload can start a stream when its first byte is a server tag.
fn starts_on_boundary(payload: &[u8]) -> bool {
    payload.first().is_some_and(|b| BACKEND_TAGS.contains(b))
}
