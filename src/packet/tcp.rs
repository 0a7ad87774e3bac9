//! TCP segment inspection and address rewriting.

use super::checksum::transport_checksum;
use super::{IpHeader, ParseError};
use std::net::SocketAddr;

/// Minimum TCP header size.
pub const TCP_HEADER_MIN_SIZE: usize = 20;

pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_ACK: u8 = 0x10;

/// Fields of a TCP header the redirector cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl TcpHeader {
    /// Decode the TCP header at the start of `segment`.
    pub fn parse(segment: &[u8]) -> Result<Self, ParseError> {
        if segment.len() < TCP_HEADER_MIN_SIZE {
            return Err(ParseError::Malformed);
        }
        let data_offset = ((segment[12] >> 4) as usize) * 4;
        if data_offset < TCP_HEADER_MIN_SIZE || data_offset > segment.len() {
            return Err(ParseError::Malformed);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            flags: segment[13],
        })
    }

    /// A connection-initiating segment: SYN set, ACK clear.
    pub fn is_initial_syn(&self) -> bool {
        self.flags & FLAG_SYN != 0 && self.flags & FLAG_ACK == 0
    }
}

/// Rewrite both endpoints of the TCP frame and recompute its checksums.
///
/// `src` and `dst` must belong to the frame's address family.
pub fn rewrite(frame: &mut [u8], ip: &mut IpHeader, src: SocketAddr, dst: SocketAddr) {
    ip.write_addrs(frame, src.ip(), dst.ip());

    let segment = &mut frame[ip.header_len..ip.total_len];
    segment[0..2].copy_from_slice(&src.port().to_be_bytes());
    segment[2..4].copy_from_slice(&dst.port().to_be_bytes());
    segment[16..18].fill(0);
    // Families already match, so a checksum is always produced
    let checksum = transport_checksum(src.ip(), dst.ip(), super::PROTO_TCP, segment).unwrap_or(0);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
}
