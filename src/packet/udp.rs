//! UDP datagram decoding and frame synthesis.

use super::checksum::transport_checksum;
use super::{write_ip_header, IpHeader, ParseError, IPV4_HEADER_SIZE, IPV6_HEADER_SIZE, PROTO_UDP};
use crate::error::{TunatError, TunatResult};
use std::net::SocketAddr;

/// UDP header size.
pub const UDP_HEADER_SIZE: usize = 8;

/// Largest payload a single IP frame can carry for the given source address.
pub fn max_payload(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => u16::MAX as usize - IPV4_HEADER_SIZE - UDP_HEADER_SIZE,
        SocketAddr::V6(_) => u16::MAX as usize - UDP_HEADER_SIZE,
    }
}

/// Decode the UDP datagram of `frame`: `(src, dst, payload)`.
///
/// The UDP length field bounds the payload and must agree with the IP header.
pub fn parse<'a>(
    frame: &'a [u8],
    ip: &IpHeader,
) -> Result<(SocketAddr, SocketAddr, &'a [u8]), ParseError> {
    let segment = ip.transport(frame);
    if segment.len() < UDP_HEADER_SIZE {
        return Err(ParseError::Malformed);
    }

    let src_port = u16::from_be_bytes([segment[0], segment[1]]);
    let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
    let length = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    if length < UDP_HEADER_SIZE || length > segment.len() {
        return Err(ParseError::Malformed);
    }

    Ok((
        SocketAddr::new(ip.src, src_port),
        SocketAddr::new(ip.dst, dst_port),
        &segment[UDP_HEADER_SIZE..length],
    ))
}

/// Build a complete IP + UDP frame carrying `payload` from `src` to `dst`.
///
/// TTL / hop limit is 64. A computed checksum of zero is sent as 0xFFFF.
pub fn build_frame(payload: &[u8], src: SocketAddr, dst: SocketAddr) -> TunatResult<Vec<u8>> {
    let header_len = match (src, dst) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => IPV4_HEADER_SIZE,
        (SocketAddr::V6(_), SocketAddr::V6(_)) => IPV6_HEADER_SIZE,
        _ => return Err(TunatError::AddressFamilyMismatch { src, dst }),
    };
    if payload.len() > max_payload(&src) {
        return Err(TunatError::PayloadTooLarge(payload.len()));
    }

    let udp_len = UDP_HEADER_SIZE + payload.len();
    let mut frame = vec![0u8; header_len + udp_len];
    write_ip_header(&mut frame, src.ip(), dst.ip(), PROTO_UDP, udp_len);

    let segment = &mut frame[header_len..];
    segment[0..2].copy_from_slice(&src.port().to_be_bytes());
    segment[2..4].copy_from_slice(&dst.port().to_be_bytes());
    segment[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    segment[UDP_HEADER_SIZE..].copy_from_slice(payload);

    let checksum = match transport_checksum(src.ip(), dst.ip(), PROTO_UDP, segment) {
        Some(0) => 0xFFFF,
        Some(checksum) => checksum,
        None => return Err(TunatError::AddressFamilyMismatch { src, dst }),
    };
    segment[6..8].copy_from_slice(&checksum.to_be_bytes());

    Ok(frame)
}
