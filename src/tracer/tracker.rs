use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use crate::protocol::{decode_parameters, statement_text, Direction, Message, ParamValue, Tag};
use crate::store::{strip_nul, CorrelationId, FinishedRecord, NewRecord, ProtocolKind, RecordStore};

/// The statement currently in flight on one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    /// `None` when the store did not accept the record.
    pub correlation_id: Option<CorrelationId>,
    pub endpoint: SocketAddr,
    pub protocol: ProtocolKind,
    pub query_text: String,
    pub parameters: Vec<ParamValue>,
    pub time_start: DateTime<Utc>,
}

/// A statement together with the server's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedQuery {
    pub correlation_id: Option<CorrelationId>,
    pub endpoint: SocketAddr,
    pub protocol: ProtocolKind,
    pub query_text: String,
    pub parameters: Vec<ParamValue>,
    pub result_text: String,
    pub error_text: String,
    pub time_start: DateTime<Utc>,
    pub time_finish: DateTime<Utc>,
    pub duration_ms: i64,
}

impl CompletedQuery {
    pub fn is_error(&self) -> bool {
        !self.error_text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Open,
}

/// Idle/Open state machine for one connection.
///
/// Store failures are logged and otherwise ignored: the in-memory record and
/// the transitions never depend on them.
#[derive(Debug, Clone)]
pub struct QueryTracker {
    endpoint: SocketAddr,
    record: Option<QueryRecord>,
}

impl QueryTracker {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self { endpoint, record: None }
    }

    pub fn state(&self) -> TrackerState {
        if self.record.is_some() {
            TrackerState::Open
        } else {
            TrackerState::Idle
        }
    }

    pub fn record(&self) -> Option<&QueryRecord> {
        self.record.as_ref()
    }

    /// Drop the open record without finishing it.
    pub fn reset<S>(&mut self, store: &mut S)
    where
        S: RecordStore + ?Sized,
    {
        let Some(record) = self.record.take() else {
            return;
        };
        tracing::debug!("{} abandoned query: {}", self.endpoint, record.query_text);
        if let Some(id) = record.correlation_id {
            if let Err(e) = store.discard_record(id) {
                tracing::warn!("error discarding query {}: {}", id, e);
            }
        }
    }

    /// Route one complete message. Returns the finished query when `message`
    /// ends the open statement.
    pub fn handle<S>(&mut self, message: &Message, now: DateTime<Utc>, store: &mut S) -> Option<CompletedQuery>
    where
        S: RecordStore + ?Sized,
    {
        match (message.direction, message.tag) {
            (Direction::Inbound, tag) if tag.begins_statement() => {
                self.begin(tag, &message.contents, now, store);
                None
            }
            (Direction::Inbound, Tag::Bind) => {
                self.bind(&message.contents, store);
                None
            }
            (Direction::Outbound, tag) if tag.is_completion() || tag == Tag::Error => {
                self.finish(message, now, store)
            }
            _ => None,
        }
    }

    /// Open a new record for a Query or Parse payload, replacing any open one.
    pub fn begin<S>(&mut self, tag: Tag, contents: &[u8], now: DateTime<Utc>, store: &mut S)
    where
        S: RecordStore + ?Sized,
    {
        let protocol = if tag == Tag::Parse {
            ProtocolKind::Extended
        } else {
            ProtocolKind::Simple
        };
        self.reset(store);
        let query_text = strip_nul(&statement_text(tag, contents)).into_owned();

        let new_record = NewRecord {
            endpoint: self.endpoint,
            protocol,
            query_text: query_text.clone(),
            time_start: now,
        };
        let correlation_id = match store.create_record(&new_record) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("error saving query from {}: {}", self.endpoint, e);
                None
            }
        };

        tracing::debug!("{} started {} query: {}", self.endpoint, protocol.as_str(), query_text);
        self.record = Some(QueryRecord {
            correlation_id,
            endpoint: self.endpoint,
            protocol,
            query_text,
            parameters: Vec::new(),
            time_start: now,
        });
    }

    /// Attach the parameters of a Bind payload to the open record.
    pub fn bind<S>(&mut self, contents: &[u8], store: &mut S)
    where
        S: RecordStore + ?Sized,
    {
        let Some(record) = self.record.as_mut() else {
            tracing::trace!("{} bind without an open statement", self.endpoint);
            return;
        };
        let params = match decode_parameters(contents) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!("{} undecodable bind parameters: {}", self.endpoint, e);
                return;
            }
        };
        if let Some(id) = record.correlation_id {
            if let Err(e) = store.store_parameters(id, &params) {
                tracing::warn!("error saving parameters of query {}: {}", id, e);
            }
        }
        record.parameters = params;
    }

    /// Close the open record with a terminal message. Ignored while idle.
    pub fn finish<S>(&mut self, terminal: &Message, now: DateTime<Utc>, store: &mut S) -> Option<CompletedQuery>
    where
        S: RecordStore + ?Sized,
    {
        let record = self.record.take()?;

        let text = strip_nul(&terminal.text()).into_owned();
        let (result_text, error_text) = if terminal.tag == Tag::Error {
            (String::new(), text)
        } else {
            (text, String::new())
        };
        let duration_ms = (now - record.time_start).num_milliseconds().max(0);

        if let Some(id) = record.correlation_id {
            let outcome = FinishedRecord {
                result_text: result_text.clone(),
                error_text: error_text.clone(),
                time_finish: now,
                duration_ms,
            };
            if let Err(e) = store.finish_record(id, &outcome) {
                tracing::warn!("error updating query {}: {}", id, e);
            }
        }

        let completed = CompletedQuery {
            correlation_id: record.correlation_id,
            endpoint: record.endpoint,
            protocol: record.protocol,
            query_text: record.query_text,
            parameters: record.parameters,
            result_text,
            error_text,
            time_start: record.time_start,
            time_finish: now,
            duration_ms,
        };
        log_completed(&completed);
        Some(completed)
    }
}

fn log_completed(query: &CompletedQuery) {
    let params: Vec<String> = query.parameters.iter().map(|p| p.to_string()).collect();
    if query.is_error() {
        tracing::info!(
            "{} {} [{}] error: {} ({} ms)",
            query.endpoint,
            query.query_text,
            params.join(", "),
            query.error_text,
            query.duration_ms
        );
    } else {
        tracing::info!(
            "{} {} [{}] -> {} ({} ms)",
            query.endpoint,
            query.query_text,
            params.join(", "),
            query.result_text,
            query.duration_ms
        );
    }
}
