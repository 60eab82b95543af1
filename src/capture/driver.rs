use std::io::Read;

use chrono::{DateTime, Utc};

use super::packet::{decode_segment, TcpSegment};
use super::pcap::{read_packets, CapturedPacket};
use super::CaptureError;
use crate::protocol::Tag;
use crate::store::RecordStore;
use crate::tracer::{CompletedQuery, Tracer};

/// Counters for one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets: u64,
    pub decoded: u64,
    pub inbound: u64,
    pub outbound: u64,
    /// Payloads on connections with no statement boundary seen yet.
    pub untracked: u64,
    pub statements: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Feeds the TCP traffic of one server port into a [`Tracer`].
///
/// A segment whose destination port is the server port goes inbound, keyed
/// by its source; one whose source port is the server port goes outbound,
/// keyed by its destination. Payloads on a connection are only delivered
/// once a Query or Parse has been seen starting a segment on it, which skips
/// the startup handshake and any statement already in flight when the
/// capture began.
pub struct CaptureDriver<S> {
    tracer: Tracer<S>,
    server_port: u16,
    stats: CaptureStats,
}

impl<S: RecordStore> CaptureDriver<S> {
    pub fn new(tracer: Tracer<S>, server_port: u16) -> Self {
        Self {
            tracer,
            server_port,
            stats: CaptureStats::default(),
        }
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn tracer(&self) -> &Tracer<S> {
        &self.tracer
    }

    pub fn into_tracer(self) -> Tracer<S> {
        self.tracer
    }

    /// Replay a whole pcap stream.
    pub fn replay<R: Read>(&mut self, input: R) -> Result<CaptureStats, CaptureError> {
        read_packets(input, |packet| {
            self.handle_packet(&packet);
        })?;
        tracing::debug!(
            "replay finished: {} packets, {} statements, {} completed",
            self.stats.packets,
            self.stats.statements,
            self.stats.completed
        );
        Ok(self.stats.clone())
    }

    pub fn handle_packet(&mut self, packet: &CapturedPacket) -> Option<CompletedQuery> {
        self.stats.packets += 1;
        let segment = decode_segment(packet.linktype, &packet.data)?;
        self.stats.decoded += 1;
        self.handle_segment(&segment, packet.timestamp)
    }

    pub fn handle_segment(&mut self, segment: &TcpSegment<'_>, at: DateTime<Utc>) -> Option<CompletedQuery> {
        let first = *segment.payload.first()?;

        if segment.dst.port() == self.server_port {
            let key = segment.src;
            if Tag::from_byte(first).begins_statement() {
                self.stats.statements += 1;
                self.tracer.notify_new_statement_at(key, at);
            }
            if !self.tracer.is_tracked(&key) {
                self.stats.untracked += 1;
                return None;
            }
            self.stats.inbound += 1;
            self.tracer.deliver_inbound_at(key, segment.payload, at);
            None
        } else if segment.src.port() == self.server_port {
            let key = segment.dst;
            if !self.tracer.is_tracked(&key) {
                self.stats.untracked += 1;
                return None;
            }
            self.stats.outbound += 1;
            let completed = self.tracer.deliver_outbound_at(key, segment.payload, at)?;
            self.stats.completed += 1;
            if completed.is_error() {
                self.stats.failed += 1;
            }
            Some(completed)
        } else {
            None
        }
    }
}
