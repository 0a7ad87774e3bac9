//! Raw IPv4/IPv6 frame parsing and rewriting.
//!
//! Frames are handled in place as byte slices. IPv6 extension headers are
//! not walked: `next_header` is taken as the transport protocol.

pub mod checksum;
pub mod tcp;
pub mod udp;

use crate::config::IpFamily;
use checksum::ipv4_header_checksum;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IPv4 header size (without options).
pub const IPV4_HEADER_SIZE: usize = 20;

/// IPv6 header size (fixed).
pub const IPV6_HEADER_SIZE: usize = 40;

/// Frames of this length or shorter carry nothing routable.
pub const MIN_FRAME_SIZE: usize = 20;

/// TCP protocol number.
pub const PROTO_TCP: u8 = 6;

/// UDP protocol number.
pub const PROTO_UDP: u8 = 17;

/// Default TTL / hop limit for synthesized frames.
pub const DEFAULT_TTL: u8 = 64;

/// Reason a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Frame is not longer than [`MIN_FRAME_SIZE`].
    TooShort,
    /// The version nibble is neither 4 nor 6.
    UnknownVersion(u8),
    /// Header lengths disagree with the frame.
    Malformed,
}

/// Decoded IP header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub family: IpFamily,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol (IPv4 protocol / IPv6 next header).
    pub protocol: u8,
    /// Offset of the transport header.
    pub header_len: usize,
    /// Length of the IP packet as declared by its header.
    pub total_len: usize,
}

impl IpHeader {
    /// Decode the IP header of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self, ParseError> {
        if frame.len() <= MIN_FRAME_SIZE {
            return Err(ParseError::TooShort);
        }

        match frame[0] >> 4 {
            4 => Self::parse_v4(frame),
            6 => Self::parse_v6(frame),
            version => Err(ParseError::UnknownVersion(version)),
        }
    }

    fn parse_v4(frame: &[u8]) -> Result<Self, ParseError> {
        let header_len = ((frame[0] & 0x0f) as usize) * 4;
        let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        if header_len < IPV4_HEADER_SIZE || total_len < header_len || total_len > frame.len() {
            return Err(ParseError::Malformed);
        }

        Ok(Self {
            family: IpFamily::V4,
            src: IpAddr::V4(Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15])),
            dst: IpAddr::V4(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19])),
            protocol: frame[9],
            header_len,
            total_len,
        })
    }

    fn parse_v6(frame: &[u8]) -> Result<Self, ParseError> {
        if frame.len() < IPV6_HEADER_SIZE {
            return Err(ParseError::Malformed);
        }
        let payload_len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        let total_len = IPV6_HEADER_SIZE + payload_len;
        if total_len > frame.len() {
            return Err(ParseError::Malformed);
        }

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&frame[8..24]);
        dst.copy_from_slice(&frame[24..40]);

        Ok(Self {
            family: IpFamily::V6,
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: frame[6],
            header_len: IPV6_HEADER_SIZE,
            total_len,
        })
    }

    /// Transport segment (header and payload) of `frame`.
    pub fn transport<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[self.header_len..self.total_len]
    }

    /// Overwrite the source and destination addresses of `frame`, updating
    /// the IPv4 header checksum. Both addresses must match the frame family.
    pub(crate) fn write_addrs(&mut self, frame: &mut [u8], src: IpAddr, dst: IpAddr) {
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                debug_assert_eq!(self.family, IpFamily::V4);
                frame[12..16].copy_from_slice(&s.octets());
                frame[16..20].copy_from_slice(&d.octets());
                frame[10..12].fill(0);
                let checksum = ipv4_header_checksum(&frame[..self.header_len]);
                frame[10..12].copy_from_slice(&checksum.to_be_bytes());
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                debug_assert_eq!(self.family, IpFamily::V6);
                frame[8..24].copy_from_slice(&s.octets());
                frame[24..40].copy_from_slice(&d.octets());
            }
            _ => unreachable!("rewrite across address families"),
        }
        self.src = src;
        self.dst = dst;
    }
}

/// Write a bare IP header for a synthesized frame into `frame`.
///
/// `payload_len` is the length of everything after the IP header.
pub(crate) fn write_ip_header(
    frame: &mut [u8],
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    payload_len: usize,
) {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let header = &mut frame[..IPV4_HEADER_SIZE];
            header.fill(0);
            header[0] = 0x45;
            header[2..4].copy_from_slice(&((IPV4_HEADER_SIZE + payload_len) as u16).to_be_bytes());
            header[8] = DEFAULT_TTL;
            header[9] = protocol;
            header[12..16].copy_from_slice(&s.octets());
            header[16..20].copy_from_slice(&d.octets());
            let checksum = ipv4_header_checksum(header);
            header[10..12].copy_from_slice(&checksum.to_be_bytes());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let header = &mut frame[..IPV6_HEADER_SIZE];
            header.fill(0);
            header[0] = 0x60;
            header[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
            header[6] = protocol;
            header[7] = DEFAULT_TTL;
            header[8..24].copy_from_slice(&s.octets());
            header[24..40].copy_from_slice(&d.octets());
        }
        _ => unreachable!("header across address families"),
    }
}
