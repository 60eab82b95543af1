//! The reconstruction engine.
//!
//! [`Tracer`] is fed captured TCP payloads in capture order, per direction,
//! and turns them into query records: statement text, bound parameters,
//! outcome and latency. It never sees sockets and never answers anything.

pub mod clock;
pub mod reassembler;
pub mod registry;
pub mod response;
pub mod scanner;
pub mod tracker;

use chrono::{DateTime, Utc};

use crate::store::RecordStore;

pub use clock::{Clock, ManualClock, SystemClock};
pub use reassembler::StreamReassembler;
pub use registry::{
    ConnectionKey, ConnectionRegistry, ConnectionState, EvictionPolicy, IdleTimeout, MaxConnections, NoEviction,
};
pub use response::{CompletionBeforeReady, ResponseAssembler, ResponseMode, TerminalPredicate};
pub use scanner::scan_response;
pub use tracker::{CompletedQuery, QueryRecord, QueryTracker, TrackerState};

pub struct Tracer<S> {
    registry: ConnectionRegistry,
    store: S,
    clock: Box<dyn Clock>,
}

impl<S: RecordStore> Tracer<S> {
    /// Scan-mode tracer with no eviction and the system clock.
    pub fn new(store: S) -> Self {
        Self {
            registry: ConnectionRegistry::new(ResponseMode::default()),
            store,
            clock: Box::new(SystemClock),
        }
    }

    /// Response handling for connections registered from now on.
    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.registry.set_mode(mode);
        self
    }

    pub fn with_eviction<P: EvictionPolicy + Send + 'static>(mut self, policy: P) -> Self {
        self.registry.set_policy(Box::new(policy));
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// The next inbound payload of `key` opens a new statement.
    pub fn notify_new_statement(&mut self, key: ConnectionKey) {
        let now = self.clock.now();
        self.notify_new_statement_at(key, now);
    }

    pub fn notify_new_statement_at(&mut self, key: ConnectionKey, at: DateTime<Utc>) {
        self.registry.touch(key, at).reset_statement(&mut self.store);
        self.discard_evicted();
    }

    /// Client-to-server bytes of `key`.
    pub fn deliver_inbound(&mut self, key: ConnectionKey, payload: &[u8]) {
        let now = self.clock.now();
        self.deliver_inbound_at(key, payload, now);
    }

    pub fn deliver_inbound_at(&mut self, key: ConnectionKey, payload: &[u8], at: DateTime<Utc>) {
        let state = self.registry.touch(key, at);
        let query = &mut state.query;
        let store = &mut self.store;
        let result = state.requests.feed(payload, |message| {
            query.handle(&message, at, store);
        });
        if let Err(e) = result {
            tracing::debug!("{}: rest of inbound payload dropped: {}", key, e);
        }
        self.discard_evicted();
    }

    /// Server-to-client bytes of `key`. Returns the query they complete, if any.
    pub fn deliver_outbound(&mut self, key: ConnectionKey, payload: &[u8]) -> Option<CompletedQuery> {
        let now = self.clock.now();
        self.deliver_outbound_at(key, payload, now)
    }

    pub fn deliver_outbound_at(
        &mut self,
        key: ConnectionKey,
        payload: &[u8],
        at: DateTime<Utc>,
    ) -> Option<CompletedQuery> {
        let state = self.registry.touch(key, at);
        let mut completed = None;
        for terminal in state.responses.feed(payload) {
            if let Some(done) = state.query.handle(&terminal, at, &mut self.store) {
                completed = completed.or(Some(done));
            }
        }
        self.discard_evicted();
        completed
    }

    /// Whether `key` has state, i.e. a statement boundary was seen on it and
    /// it has not been evicted since.
    pub fn is_tracked(&self, key: &ConnectionKey) -> bool {
        self.registry.contains(key)
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<&ConnectionState> {
        self.registry.get(key)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn discard_evicted(&mut self) {
        for id in self.registry.take_abandoned() {
            if let Err(e) = self.store.discard_record(id) {
                tracing::warn!("error discarding query {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ProtocolKind};
    use bytes::{BufMut, BytesMut};
    use chrono::{Duration, TimeZone};

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_slice(body);
        buf.to_vec()
    }

    fn select_one_response() -> Vec<u8> {
        let mut payload = frame(b'C', b"SELECT 1\0");
        payload.extend(frame(b'Z', b"I"));
        payload
    }

    fn client() -> ConnectionKey {
        "192.168.1.20:50000".parse().unwrap()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    // ========================================================================
    // SIMPLE PROTOCOL
    // ========================================================================

    #[test]
    fn test_select_one_roundtrip() {
        let clock = ManualClock::new(start());
        let mut tracer = Tracer::new(MemoryStore::new()).with_clock(clock.clone());

        let query = frame(b'Q', b"SELECT 1\0");
        assert_eq!(&query[..5], &[b'Q', 0, 0, 0, 13]);
        tracer.notify_new_statement(client());
        tracer.deliver_inbound(client(), &query);

        clock.advance(Duration::milliseconds(3));
        let done = tracer.deliver_outbound(client(), &select_one_response()).unwrap();
        assert_eq!(done.query_text, "SELECT 1");
        assert_eq!(done.result_text, "SELECT 1");
        assert_eq!(done.duration_ms, 3);
        assert!(done.time_finish > done.time_start);

        let stored = &tracer.store().records()[0];
        assert_eq!(stored.record.endpoint, client());
        assert_eq!(stored.record.protocol, ProtocolKind::Simple);
        assert_eq!(stored.outcome.as_ref().unwrap().result_text, "SELECT 1");
    }

    #[test]
    fn test_query_split_over_packets() {
        let mut tracer = Tracer::new(MemoryStore::new());
        let query = frame(b'Q', b"SELECT * FROM pg_catalog.pg_tables\0");
        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &query[..12], start());
        assert!(tracer.store().records().is_empty());
        tracer.deliver_inbound_at(client(), &query[12..], start());
        assert_eq!(tracer.store().records()[0].record.query_text, "SELECT * FROM pg_catalog.pg_tables");
    }

    #[test]
    fn test_response_without_statement_is_ignored() {
        let mut tracer = Tracer::new(MemoryStore::new());
        assert!(tracer.deliver_outbound_at(client(), &select_one_response(), start()).is_none());
        assert!(tracer.store().records().is_empty());
    }

    #[test]
    fn test_error_response_finishes_query() {
        let mut tracer = Tracer::new(MemoryStore::new());
        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &frame(b'Q', b"SELECT * FROM missing\0"), start());
        let mut response = frame(b'E', b"SERROR\0C42P01\0Mrelation \"missing\" does not exist\0\0");
        response.extend(frame(b'Z', b"I"));
        let done = tracer
            .deliver_outbound_at(client(), &response, start() + Duration::milliseconds(1))
            .unwrap();
        assert!(done.is_error());
        assert!(done.error_text.contains("does not exist"));
    }

    // ========================================================================
    // EXTENDED PROTOCOL
    // ========================================================================

    #[test]
    fn test_extended_protocol_in_one_chunk() {
        let mut tracer = Tracer::new(MemoryStore::new());
        let mut chunk = frame(b'P', b"\0INSERT INTO t VALUES ($1, $2)\0\0\0");
        chunk.extend(frame(b'B', b"\0\0\0\0\0\x02\0\0\0\x0242\xff\xff\xff\xff\0\0"));
        chunk.extend(frame(b'D', b"P\0"));
        chunk.extend(frame(b'E', b"\0\0\0\0\0"));
        chunk.extend(frame(b'S', b""));

        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &chunk, start());

        let mut response = frame(b'1', b"");
        response.extend(frame(b'2', b""));
        response.extend(frame(b'n', b""));
        response.extend(frame(b'C', b"INSERT 0 1\0"));
        response.extend(frame(b'Z', b"I"));
        let done = tracer.deliver_outbound_at(client(), &response, start()).unwrap();

        assert_eq!(done.protocol, ProtocolKind::Extended);
        assert_eq!(done.query_text, "INSERT INTO t VALUES ($1, $2)");
        let params: Vec<String> = done.parameters.iter().map(|p| p.to_string()).collect();
        assert_eq!(params, vec!["42".to_string(), "NULL".to_string()]);
        assert_eq!(done.result_text, "INSERT 0 1");
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    #[test]
    fn test_connections_are_independent() {
        let other: ConnectionKey = "192.168.1.21:50001".parse().unwrap();
        let mut tracer = Tracer::new(MemoryStore::new());
        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &frame(b'Q', b"SELECT 1\0"), start());
        tracer.notify_new_statement_at(other, start());
        tracer.deliver_inbound_at(other, &frame(b'Q', b"SELECT 2\0"), start());

        let mut response = frame(b'C', b"SELECT 1\0");
        response.extend(frame(b'Z', b"I"));
        let done = tracer.deliver_outbound_at(other, &response, start()).unwrap();
        assert_eq!(done.query_text, "SELECT 2");
        assert!(tracer.connection(&client()).unwrap().has_open_query());
    }

    #[test]
    fn test_notify_discards_unfinished_request() {
        let mut tracer = Tracer::new(MemoryStore::new());
        let first = frame(b'Q', b"SELECT pg_sleep(10)\0");
        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &first[..10], start());

        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &frame(b'Q', b"SELECT 1\0"), start());
        let done = tracer.deliver_outbound_at(client(), &select_one_response(), start()).unwrap();
        assert_eq!(done.query_text, "SELECT 1");
        assert_eq!(tracer.store().records().len(), 1);
    }

    #[test]
    fn test_is_tracked_follows_eviction() {
        let mut tracer = Tracer::new(MemoryStore::new()).with_eviction(MaxConnections::new(1));
        let other: ConnectionKey = "192.168.1.21:50001".parse().unwrap();
        assert!(!tracer.is_tracked(&client()));
        tracer.notify_new_statement_at(client(), start());
        assert!(tracer.is_tracked(&client()));
        tracer.notify_new_statement_at(other, start() + Duration::seconds(1));
        assert!(!tracer.is_tracked(&client()));
        assert!(tracer.is_tracked(&other));
        assert_eq!(tracer.registry().evicted(), 1);
    }

    #[test]
    fn test_replaced_and_evicted_records_are_discarded() {
        let other: ConnectionKey = "192.168.1.21:50001".parse().unwrap();
        let mut tracer = Tracer::new(MemoryStore::new()).with_eviction(MaxConnections::new(1));

        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &frame(b'Q', b"SELECT 1\0"), start());
        // Completion never arrives; the next statement replaces it.
        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &frame(b'Q', b"SELECT 2\0"), start());
        assert!(tracer.store().get(1).unwrap().abandoned);
        assert!(!tracer.store().get(2).unwrap().abandoned);

        tracer.notify_new_statement_at(other, start() + Duration::seconds(1));
        assert!(!tracer.is_tracked(&client()));
        assert!(tracer.store().get(2).unwrap().abandoned);
    }

    #[test]
    fn test_corrupt_connection_does_not_affect_others() {
        let other: ConnectionKey = "192.168.1.21:50001".parse().unwrap();
        let mut tracer = Tracer::new(MemoryStore::new());
        tracer.notify_new_statement_at(client(), start());
        tracer.notify_new_statement_at(other, start());

        // Declared length below four, then one far above the frame limit.
        tracer.deliver_inbound_at(client(), &[b'Q', 0, 0, 0, 2, b'x', b'y'], start());
        tracer.deliver_inbound_at(other, &frame(b'Q', b"SELECT 2\0"), start());
        tracer.deliver_inbound_at(client(), &[b'Q', 0x7f, 0xff, 0xff, 0xff, b'S'], start());
        assert!(tracer.deliver_outbound_at(client(), &[b'C', 0, 0, 0, 1, b'Z'], start()).is_none());
        assert!(tracer
            .deliver_outbound_at(client(), &[b'Z', 0xff, 0xff, 0xff, 0xff, b'I'], start())
            .is_none());

        let mut response = frame(b'C', b"SELECT 1\0");
        response.extend(frame(b'Z', b"I"));
        let done = tracer
            .deliver_outbound_at(other, &response, start() + Duration::milliseconds(4))
            .unwrap();
        assert_eq!(done.endpoint, other);
        assert_eq!(done.query_text, "SELECT 2");
        assert_eq!(done.duration_ms, 4);
        assert!(!tracer.connection(&client()).unwrap().has_open_query());
        assert_eq!(tracer.store().records().len(), 1);
    }

    #[test]
    fn test_stream_mode_tracer_handles_split_response() {
        let mut tracer = Tracer::new(MemoryStore::new()).with_response_mode(ResponseMode::Stream);
        tracer.notify_new_statement_at(client(), start());
        tracer.deliver_inbound_at(client(), &frame(b'Q', b"SELECT 1\0"), start());
        let response = select_one_response();
        assert!(tracer.deliver_outbound_at(client(), &response[..7], start()).is_none());
        let done = tracer.deliver_outbound_at(client(), &response[7..], start()).unwrap();
        assert_eq!(done.result_text, "SELECT 1");
    }
}
