//! Per-connection state and its lifetime.
//!
//! Connections are keyed by the client endpoint. State is created on first
//! sight; whether it is ever dropped again is decided by an [`EvictionPolicy`],
//! consulted each time a new connection is registered.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Duration, Utc};

use crate::protocol::Direction;
use crate::store::{CorrelationId, RecordStore};

use super::reassembler::StreamReassembler;
use super::response::{ResponseAssembler, ResponseMode};
use super::tracker::{QueryTracker, TrackerState};

/// Client address and port.
pub type ConnectionKey = SocketAddr;

/// Everything known about one client connection.
pub struct ConnectionState {
    pub requests: StreamReassembler,
    pub responses: ResponseAssembler,
    pub query: QueryTracker,
    pub last_seen: DateTime<Utc>,
}

impl ConnectionState {
    pub fn new(key: ConnectionKey, mode: ResponseMode, now: DateTime<Utc>) -> Self {
        Self {
            requests: StreamReassembler::new(Direction::Inbound),
            responses: ResponseAssembler::new(mode),
            query: QueryTracker::new(key),
            last_seen: now,
        }
    }

    /// A new top-level statement starts: abandon the open record and forget
    /// any partially reassembled traffic.
    pub fn reset_statement<S>(&mut self, store: &mut S)
    where
        S: RecordStore + ?Sized,
    {
        self.requests.reset();
        self.responses.reset();
        self.query.reset(store);
    }

    pub fn has_open_query(&self) -> bool {
        self.query.state() == TrackerState::Open
    }
}

/// Decides which connections to drop.
pub trait EvictionPolicy {
    /// Keys to evict from `connections` at time `now`. `current` is the
    /// connection being registered and must not be returned.
    fn select(
        &self,
        connections: &HashMap<ConnectionKey, ConnectionState>,
        current: &ConnectionKey,
        now: DateTime<Utc>,
    ) -> Vec<ConnectionKey>;
}

/// Keep every connection for the life of the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn select(
        &self,
        _connections: &HashMap<ConnectionKey, ConnectionState>,
        _current: &ConnectionKey,
        _now: DateTime<Utc>,
    ) -> Vec<ConnectionKey> {
        Vec::new()
    }
}

/// Drop connections with no traffic for longer than `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    pub timeout: Duration,
}

impl IdleTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl EvictionPolicy for IdleTimeout {
    fn select(
        &self,
        connections: &HashMap<ConnectionKey, ConnectionState>,
        current: &ConnectionKey,
        now: DateTime<Utc>,
    ) -> Vec<ConnectionKey> {
        connections
            .iter()
            .filter(|(key, state)| *key != current && now - state.last_seen > self.timeout)
            .map(|(key, _)| *key)
            .collect()
    }
}

/// Keep at most `max` connections, dropping the least recently seen.
#[derive(Debug, Clone, Copy)]
pub struct MaxConnections {
    pub max: usize,
}

impl MaxConnections {
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1) }
    }
}

impl EvictionPolicy for MaxConnections {
    fn select(
        &self,
        connections: &HashMap<ConnectionKey, ConnectionState>,
        current: &ConnectionKey,
        _now: DateTime<Utc>,
    ) -> Vec<ConnectionKey> {
        let excess = connections.len().saturating_sub(self.max);
        if excess == 0 {
            return Vec::new();
        }
        let mut others: Vec<(&ConnectionKey, DateTime<Utc>)> = connections
            .iter()
            .filter(|(key, _)| *key != current)
            .map(|(key, state)| (key, state.last_seen))
            .collect();
        others.sort_by_key(|(key, seen)| (*seen, **key));
        others.into_iter().take(excess).map(|(key, _)| *key).collect()
    }
}

/// Both policies apply; a connection selected by either is dropped.
impl<A: EvictionPolicy, B: EvictionPolicy> EvictionPolicy for (A, B) {
    fn select(
        &self,
        connections: &HashMap<ConnectionKey, ConnectionState>,
        current: &ConnectionKey,
        now: DateTime<Utc>,
    ) -> Vec<ConnectionKey> {
        let mut keys = self.0.select(connections, current, now);
        for key in self.1.select(connections, current, now) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Owner of all [`ConnectionState`]s.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionKey, ConnectionState>,
    mode: ResponseMode,
    policy: Box<dyn EvictionPolicy + Send>,
    evicted: u64,
    abandoned: Vec<CorrelationId>,
}

impl ConnectionRegistry {
    pub fn new(mode: ResponseMode) -> Self {
        Self::with_policy(mode, Box::new(NoEviction))
    }

    pub fn with_policy(mode: ResponseMode, policy: Box<dyn EvictionPolicy + Send>) -> Self {
        Self {
            connections: HashMap::new(),
            mode,
            policy,
            evicted: 0,
            abandoned: Vec::new(),
        }
    }

    pub fn set_policy(&mut self, policy: Box<dyn EvictionPolicy + Send>) {
        self.policy = policy;
    }

    /// Applies to connections created after the call.
    pub fn set_mode(&mut self, mode: ResponseMode) {
        self.mode = mode;
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&ConnectionState> {
        self.connections.get(key)
    }

    /// Total number of connections dropped by the eviction policy.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Store ids of the open records dropped with evicted connections since
    /// the last call.
    pub fn take_abandoned(&mut self) -> Vec<CorrelationId> {
        std::mem::take(&mut self.abandoned)
    }

    /// State for `key`, created if missing, with `last_seen` moved to `now`.
    pub fn touch(&mut self, key: ConnectionKey, now: DateTime<Utc>) -> &mut ConnectionState {
        let mode = self.mode;
        if !self.connections.contains_key(&key) {
            self.connections.insert(key, ConnectionState::new(key, mode, now));
            self.sweep(&key, now);
        }
        let state = self
            .connections
            .entry(key)
            .or_insert_with(|| ConnectionState::new(key, mode, now));
        if now > state.last_seen {
            state.last_seen = now;
        }
        state
    }

    fn sweep(&mut self, current: &ConnectionKey, now: DateTime<Utc>) {
        for key in self.policy.select(&self.connections, current, now) {
            if key == *current {
                continue;
            }
            if let Some(state) = self.connections.remove(&key) {
                self.evicted += 1;
                if let Some(record) = state.query.record() {
                    tracing::debug!("evicting {} with a query still open", key);
                    self.abandoned.extend(record.correlation_id);
                } else {
                    tracing::trace!("evicting {}", key);
                }
            }
        }
    }
}
