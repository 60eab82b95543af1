// Link, network and transport header decoding down to the TCP payload

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const LINKTYPE_NULL: i32 = 0;
pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_LOOP: i32 = 108;
pub const LINKTYPE_LINUX_SLL: i32 = 113;
pub const LINKTYPE_IPV4: i32 = 228;
pub const LINKTYPE_IPV6: i32 = 229;
pub const LINKTYPE_LINUX_SLL2: i32 = 276;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IPPROTO_TCP: u8 = 6;

/// The part of a TCP packet the tracer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: &'a [u8],
}

/// Decode one captured frame. Returns `None` for anything that is not an
/// unfragmented TCP packet over IPv4 or IPv6, or that is truncated.
pub fn decode_segment(linktype: i32, frame: &[u8]) -> Option<TcpSegment<'_>> {
    match linktype {
        LINKTYPE_ETHERNET => ethernet(frame),
        LINKTYPE_NULL => {
            let family = u32::from_ne_bytes(frame.get(..4)?.try_into().ok()?);
            loopback(family, frame.get(4..)?)
        }
        LINKTYPE_LOOP => {
            let family = u32::from_be_bytes(frame.get(..4)?.try_into().ok()?);
            loopback(family, frame.get(4..)?)
        }
        LINKTYPE_LINUX_SLL => ethertype(be16(frame, 14)?, frame.get(16..)?),
        LINKTYPE_LINUX_SLL2 => ethertype(be16(frame, 0)?, frame.get(20..)?),
        LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => ip(frame),
        _ => None,
    }
}

fn be16(buf: &[u8], pos: usize) -> Option<u16> {
    let b = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn ethernet(frame: &[u8]) -> Option<TcpSegment<'_>> {
    let mut pos = 12;
    let mut kind = be16(frame, pos)?;
    while kind == ETHERTYPE_VLAN || kind == ETHERTYPE_QINQ {
        pos += 4;
        kind = be16(frame, pos)?;
    }
    ethertype(kind, frame.get(pos + 2..)?)
}

fn ethertype(kind: u16, packet: &[u8]) -> Option<TcpSegment<'_>> {
    match kind {
        ETHERTYPE_IPV4 => ipv4(packet),
        ETHERTYPE_IPV6 => ipv6(packet),
        _ => None,
    }
}

// BSD loopback address family; IPv6 has a different value per platform.
fn loopback(family: u32, packet: &[u8]) -> Option<TcpSegment<'_>> {
    match family {
        2 => ipv4(packet),
        10 | 24 | 28 | 30 => ipv6(packet),
        _ => None,
    }
}

fn ip(packet: &[u8]) -> Option<TcpSegment<'_>> {
    match packet.first()? >> 4 {
        4 => ipv4(packet),
        6 => ipv6(packet),
        _ => None,
    }
}

fn ipv4(packet: &[u8]) -> Option<TcpSegment<'_>> {
    let header_len = usize::from(packet.first()? & 0x0f) * 4;
    if packet[0] >> 4 != 4 || header_len < 20 || packet.len() < header_len {
        return None;
    }
    // More-fragments flag or a fragment offset: not reassembled.
    if be16(packet, 6)? & 0x3fff != 0 || packet[9] != IPPROTO_TCP {
        return None;
    }
    // Total length excludes link-layer padding.
    let total_len = usize::from(be16(packet, 2)?).clamp(header_len, packet.len());
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    tcp(IpAddr::V4(src), IpAddr::V4(dst), &packet[header_len..total_len])
}

fn ipv6(packet: &[u8]) -> Option<TcpSegment<'_>> {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return None;
    }
    let payload_len = usize::from(be16(packet, 4)?);
    let end = (40 + payload_len).min(packet.len());
    let src: [u8; 16] = packet[8..24].try_into().ok()?;
    let dst: [u8; 16] = packet[24..40].try_into().ok()?;

    let mut next = packet[6];
    let mut pos = 40;
    loop {
        match next {
            IPPROTO_TCP => break,
            // Hop-by-hop, routing and destination options.
            0 | 43 | 60 => {
                let ext = packet.get(pos..pos + 2)?;
                next = ext[0];
                pos += (usize::from(ext[1]) + 1) * 8;
            }
            _ => return None,
        }
    }
    let body = packet.get(pos..end)?;
    tcp(IpAddr::V6(Ipv6Addr::from(src)), IpAddr::V6(Ipv6Addr::from(dst)), body)
}

fn tcp(src: IpAddr, dst: IpAddr, segment: &[u8]) -> Option<TcpSegment<'_>> {
    let src_port = be16(segment, 0)?;
    let dst_port = be16(segment, 2)?;
    let data_offset = usize::from(*segment.get(12)? >> 4) * 4;
    if data_offset < 20 {
        return None;
    }
    Some(TcpSegment {
        src: SocketAddr::new(src, src_port),
        dst: SocketAddr::new(dst, dst_port),
        payload: segment.get(data_offset..)?,
    })
}
