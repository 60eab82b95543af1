//! Persistence of reconstructed query records.
//!
//! The tracer talks to storage through [`RecordStore`]. Three backends ship
//! with the crate: [`SqliteStore`] for durable output, [`MemoryStore`] for
//! tests and embedding, and [`ChannelStore`] which hands every call to a
//! [`PersistWorker`] task so that slow storage never stalls packet replay.

pub mod channel;
pub mod memory;
pub mod sqlite;

use std::borrow::Cow;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::ParamValue;

pub use channel::{ChannelStore, PersistStats, PersistWorker, StoreCommand};
pub use memory::{MemoryRecord, MemoryStore};
pub use sqlite::{SqliteStore, StoredQuery};

/// Identifier handed out by a store when a record is created.
pub type CorrelationId = i64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Persistence channel closed")]
    ChannelClosed,
    #[error("Unknown record {0}")]
    UnknownRecord(CorrelationId),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Simple (text) or extended (parse/bind) query protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Simple,
    Extended,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Simple => "simple",
            ProtocolKind::Extended => "extended",
        }
    }
}

/// Fields known when a statement is first seen.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub endpoint: SocketAddr,
    pub protocol: ProtocolKind,
    pub query_text: String,
    pub time_start: DateTime<Utc>,
}

/// Fields known once the server has answered.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRecord {
    pub result_text: String,
    pub error_text: String,
    pub time_finish: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Persistence collaborator of the query tracker.
///
/// Failures are reported to the caller, which logs them and carries on;
/// a store must never be relied on for the in-memory view of a query.
pub trait RecordStore {
    fn create_record(&mut self, record: &NewRecord) -> Result<CorrelationId, StoreError>;

    fn store_parameters(&mut self, id: CorrelationId, params: &[ParamValue]) -> Result<(), StoreError>;

    fn finish_record(&mut self, id: CorrelationId, outcome: &FinishedRecord) -> Result<(), StoreError>;

    /// The record will never be finished: its statement was replaced or its
    /// connection evicted. What remains stored is left as is.
    fn discard_record(&mut self, _id: CorrelationId) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn create_record(&mut self, record: &NewRecord) -> Result<CorrelationId, StoreError> {
        (**self).create_record(record)
    }

    fn store_parameters(&mut self, id: CorrelationId, params: &[ParamValue]) -> Result<(), StoreError> {
        (**self).store_parameters(id, params)
    }

    fn finish_record(&mut self, id: CorrelationId, outcome: &FinishedRecord) -> Result<(), StoreError> {
        (**self).finish_record(id, outcome)
    }

    fn discard_record(&mut self, id: CorrelationId) -> Result<(), StoreError> {
        (**self).discard_record(id)
    }
}

/// Remove embedded NUL bytes; the storage formats reject them in text columns.
pub fn strip_nul(text: &str) -> Cow<'_, str> {
    if text.contains('\0') {
        Cow::Owned(text.replace('\0', ""))
    } else {
        Cow::Borrowed(text)
    }
}
