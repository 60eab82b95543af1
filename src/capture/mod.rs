//! Offline packet capture replay.
//!
//! A legacy pcap file is read packet by packet, each frame is decoded down to
//! its TCP payload, and [`CaptureDriver`] routes the payloads of the traced
//! server port into a [`crate::tracer::Tracer`].

pub mod driver;
pub mod packet;
pub mod pcap;

use thiserror::Error;

pub use driver::{CaptureDriver, CaptureStats};
pub use packet::{decode_segment, TcpSegment};
pub use pcap::{read_packets, CapturedPacket};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid capture file: {0}")]
    Format(String),
    #[error("Capture truncated after {packets} packets ({trailing} bytes of an incomplete record)")]
    Truncated { packets: u64, trailing: usize },
}
