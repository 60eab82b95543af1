//! Asynchronous persistence: the tracer enqueues, a worker task writes.
//!
//! [`ChannelStore`] answers `create_record` immediately with a local ticket and
//! forwards every call over a bounded channel. [`PersistWorker`] drains the
//! channel in order, translating tickets into the ids of the real backend.
//! Because one FIFO carries all commands, a record is always created before
//! its parameters or outcome are written. A full channel blocks the caller,
//! which is the backpressure point for packet replay.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::{CorrelationId, FinishedRecord, NewRecord, RecordStore, StoreError};
use crate::protocol::ParamValue;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    Create { ticket: CorrelationId, record: NewRecord },
    Parameters { ticket: CorrelationId, params: Vec<ParamValue> },
    Finish { ticket: CorrelationId, outcome: FinishedRecord },
    Discard { ticket: CorrelationId },
}

/// Sending half; implements [`RecordStore`] for the tracer.
///
/// Calls use `blocking_send` and so must be made from outside the async
/// runtime, e.g. inside `tokio::task::spawn_blocking`.
#[derive(Debug)]
pub struct ChannelStore {
    tx: mpsc::Sender<StoreCommand>,
    next_ticket: CorrelationId,
}

/// Counters reported by [`PersistWorker::run`] when the channel closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub created: u64,
    pub parameter_sets: u64,
    pub finished: u64,
    pub failures: u64,
    pub skipped: u64,
    pub discarded: u64,
}

/// Receiving half; owns the real store.
pub struct PersistWorker<S> {
    rx: mpsc::Receiver<StoreCommand>,
    store: S,
    ids: HashMap<CorrelationId, CorrelationId>,
    stats: PersistStats,
}

/// Build a connected store/worker pair with room for `capacity` pending commands.
pub fn channel<S: RecordStore>(store: S, capacity: usize) -> (ChannelStore, PersistWorker<S>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = ChannelStore { tx, next_ticket: 0 };
    let worker = PersistWorker {
        rx,
        store,
        ids: HashMap::new(),
        stats: PersistStats::default(),
    };
    (sender, worker)
}

impl ChannelStore {
    fn send(&self, command: StoreCommand) -> Result<(), StoreError> {
        self.tx.blocking_send(command).map_err(|_| StoreError::ChannelClosed)
    }
}

impl RecordStore for ChannelStore {
    fn create_record(&mut self, record: &NewRecord) -> Result<CorrelationId, StoreError> {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.send(StoreCommand::Create { ticket, record: record.clone() })?;
        Ok(ticket)
    }

    fn store_parameters(&mut self, id: CorrelationId, params: &[ParamValue]) -> Result<(), StoreError> {
        self.send(StoreCommand::Parameters { ticket: id, params: params.to_vec() })
    }

    fn finish_record(&mut self, id: CorrelationId, outcome: &FinishedRecord) -> Result<(), StoreError> {
        self.send(StoreCommand::Finish { ticket: id, outcome: outcome.clone() })
    }

    fn discard_record(&mut self, id: CorrelationId) -> Result<(), StoreError> {
        self.send(StoreCommand::Discard { ticket: id })
    }
}

impl<S: RecordStore> PersistWorker<S> {
    /// Apply commands until every [`ChannelStore`] is dropped, then hand the store back.
    pub async fn run(mut self) -> (S, PersistStats) {
        while let Some(command) = self.rx.recv().await {
            self.apply(command);
        }
        tracing::debug!(
            "persistence worker done: {} created, {} finished, {} failures",
            self.stats.created,
            self.stats.finished,
            self.stats.failures
        );
        (self.store, self.stats)
    }

    /// Apply one command. Failures are logged; commands for tickets whose
    /// creation failed are skipped. A ticket is forgotten once finished or
    /// discarded.
    pub fn apply(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::Create { ticket, record } => match self.store.create_record(&record) {
                Ok(id) => {
                    self.ids.insert(ticket, id);
                    self.stats.created += 1;
                }
                Err(e) => {
                    self.stats.failures += 1;
                    tracing::warn!("error saving query from {}: {}", record.endpoint, e);
                }
            },
            StoreCommand::Parameters { ticket, params } => {
                let Some(&id) = self.ids.get(&ticket) else {
                    self.stats.skipped += 1;
                    return;
                };
                match self.store.store_parameters(id, &params) {
                    Ok(()) => self.stats.parameter_sets += 1,
                    Err(e) => {
                        self.stats.failures += 1;
                        tracing::warn!("error saving parameters of query {}: {}", id, e);
                    }
                }
            }
            StoreCommand::Finish { ticket, outcome } => {
                let Some(id) = self.ids.remove(&ticket) else {
                    self.stats.skipped += 1;
                    return;
                };
                match self.store.finish_record(id, &outcome) {
                    Ok(()) => self.stats.finished += 1,
                    Err(e) => {
                        self.stats.failures += 1;
                        tracing::warn!("error updating query {}: {}", id, e);
                    }
                }
            }
            StoreCommand::Discard { ticket } => {
                let Some(id) = self.ids.remove(&ticket) else {
                    self.stats.skipped += 1;
                    return;
                };
                self.stats.discarded += 1;
                if let Err(e) = self.store.discard_record(id) {
                    self.stats.failures += 1;
                    tracing::warn!("error discarding query {}: {}", id, e);
                }
            }
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Tickets created but not yet finished or discarded.
    pub fn pending(&self) -> usize {
        self.ids.len()
    }
}
