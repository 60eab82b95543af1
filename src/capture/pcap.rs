use std::io::Read;

use chrono::{DateTime, Utc};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

use super::CaptureError;

/// Read buffer of the pcap reader; must hold the largest captured packet.
const READ_BUFFER_SIZE: usize = 256 * 1024;

const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_b2a1;

/// One captured frame, still carrying its link-layer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub timestamp: DateTime<Utc>,
    pub linktype: i32,
    pub data: Vec<u8>,
}

/// Stream every packet of a legacy pcap capture to `on_packet`, in file order.
/// Returns the number of packets read.
pub fn read_packets<R, F>(input: R, mut on_packet: F) -> Result<u64, CaptureError>
where
    R: Read,
    F: FnMut(CapturedPacket),
{
    let mut reader = LegacyPcapReader::new(READ_BUFFER_SIZE, input)
        .map_err(|e| CaptureError::Format(format!("not a legacy pcap file: {:?}", e)))?;

    let mut linktype = 0;
    let mut nanos = false;
    let mut count = 0u64;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let packet = match block {
                    PcapBlockOwned::LegacyHeader(ref header) => {
                        linktype = header.network.0;
                        nanos = matches!(header.magic_number, MAGIC_NANOS | MAGIC_NANOS_SWAPPED);
                        tracing::debug!("pcap linktype {}, snaplen {}", linktype, header.snaplen);
                        None
                    }
                    PcapBlockOwned::Legacy(ref block) => {
                        let sub_nanos = if nanos { block.ts_usec } else { block.ts_usec.saturating_mul(1000) };
                        Some(CapturedPacket {
                            timestamp: timestamp(block.ts_sec, sub_nanos),
                            linktype,
                            data: block.data.to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(_) => {
                        tracing::warn!("pcapng block in legacy capture, skipped");
                        None
                    }
                };
                drop(block);
                reader.consume(offset);
                if let Some(packet) = packet {
                    count += 1;
                    on_packet(packet);
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete { .. }) => {
                let buffered = reader.data().len();
                reader
                    .refill()
                    .map_err(|e| CaptureError::Format(format!("refill error: {:?}", e)))?;
                // No new bytes: the input ended inside a record, or the record
                // does not fit the read buffer.
                if reader.data().len() == buffered {
                    return Err(CaptureError::Truncated { packets: count, trailing: buffered });
                }
            }
            Err(e) => return Err(CaptureError::Format(format!("pcap parse error: {:?}", e))),
        }
    }

    Ok(count)
}

fn timestamp(secs: u32, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), nanos.min(999_999_999)).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Little-endian legacy pcap bytes holding `packets` as (seconds, sub-second, frame).
    pub(crate) fn pcap_bytes(magic: u32, linktype: u32, packets: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&magic.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&linktype.to_le_bytes());
        for (sec, sub, data) in packets {
            out.extend_from_slice(&sec.to_le_bytes());
            out.extend_from_slice(&sub.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn test_reads_packets_in_order() {
        let bytes = pcap_bytes(
            0xa1b2_c3d4,
            1,
            &[(1_700_000_000, 250_000, vec![1, 2, 3]), (1_700_000_001, 0, vec![4, 5])],
        );
        let mut packets = Vec::new();
        let count = read_packets(Cursor::new(bytes), |p| packets.push(p)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(packets[0].data, vec![1, 2, 3]);
        assert_eq!(packets[0].linktype, 1);
        assert_eq!(packets[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(packets[0].timestamp.timestamp_subsec_micros(), 250_000);
        assert_eq!(packets[1].data, vec![4, 5]);
    }

    #[test]
    fn test_nanosecond_magic() {
        let bytes = pcap_bytes(MAGIC_NANOS, 101, &[(10, 123_456_789, vec![0x45])]);
        let mut packets = Vec::new();
        read_packets(Cursor::new(bytes), |p| packets.push(p)).unwrap();
        assert_eq!(packets[0].timestamp.timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(packets[0].linktype, 101);
    }

    #[test]
    fn test_empty_capture() {
        let bytes = pcap_bytes(0xa1b2_c3d4, 1, &[]);
        let count = read_packets(Cursor::new(bytes), |_| panic!("no packets expected")).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_truncated_last_record() {
        let mut bytes = pcap_bytes(
            0xa1b2_c3d4,
            1,
            &[(1_700_000_000, 0, vec![7; 60]), (1_700_000_001, 0, vec![9; 100])],
        );
        bytes.truncate(bytes.len() - 10);
        let mut packets = Vec::new();
        let err = read_packets(Cursor::new(bytes), |p| packets.push(p)).unwrap_err();
        match err {
            CaptureError::Truncated { packets: count, trailing } => {
                assert_eq!(count, 1);
                assert_eq!(trailing, 16 + 90);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![7; 60]);
    }

    #[test]
    fn test_truncated_record_header() {
        let mut bytes = pcap_bytes(0xa1b2_c3d4, 1, &[(1_700_000_000, 0, vec![1, 2, 3])]);
        bytes.truncate(24 + 6);
        let result = read_packets(Cursor::new(bytes), |_| panic!("no packets expected"));
        assert!(matches!(result, Err(CaptureError::Truncated { packets: 0, trailing: 6 })));
    }

    #[test]
    fn test_not_a_pcap() {
        let result = read_packets(Cursor::new(b"definitely not a capture file".to_vec()), |_| {});
        assert!(matches!(result, Err(CaptureError::Format(_))));
    }
}
