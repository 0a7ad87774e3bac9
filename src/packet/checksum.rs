//! Internet checksum helpers.
//!
//! The IPv4 header carries its own checksum (IPv6 does not), and TCP/UDP
//! checksums cover a pseudo-header built from the enclosing IP addresses.
//! Both have to be recomputed whenever the redirector rewrites an address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Compute the ones' complement sum of 16-bit words in a byte slice.
#[inline]
pub fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }

    // Odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    sum
}

/// Fold a 32-bit sum into a 16-bit ones' complement value.
#[inline]
pub fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Compute the final ones' complement checksum.
#[inline]
pub fn compute_checksum(data: &[u8]) -> u16 {
    !fold_checksum(ones_complement_sum(data))
}

/// Compute IPv4 header checksum.
///
/// The checksum field in the header should be set to 0 before calling this.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    debug_assert!(
        header.len() >= 20 && header.len() % 4 == 0,
        "invalid IPv4 header length {}",
        header.len()
    );
    compute_checksum(header)
}

/// Compute IPv4 pseudo-header contribution to TCP/UDP checksum.
pub fn ipv4_pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    ones_complement_sum(&src.octets())
        + ones_complement_sum(&dst.octets())
        + protocol as u32
        + length as u32
}

/// Compute IPv6 pseudo-header contribution to TCP/UDP checksum.
pub fn ipv6_pseudo_header_sum(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, length: u32) -> u32 {
    let mut sum = ones_complement_sum(&src.octets()) + ones_complement_sum(&dst.octets());

    // Upper-layer length is 32 bits, summed as two 16-bit words
    sum += length >> 16;
    sum += length & 0xFFFF;

    // Next header padded to 32 bits
    sum += next_header as u32;

    sum
}

/// Compute a TCP or UDP checksum over `segment` (header with a zeroed
/// checksum field, followed by the payload).
///
/// Returns `None` if the addresses belong to different families.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> Option<u16> {
    let pseudo = match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            ipv4_pseudo_header_sum(src, dst, protocol, segment.len() as u16)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            ipv6_pseudo_header_sum(src, dst, protocol, segment.len() as u32)
        }
        _ => return None,
    };

    // Fold the pseudo-header first so the segment sum cannot overflow u32
    let sum = fold_checksum(pseudo) as u32 + ones_complement_sum(segment);
    Some(!fold_checksum(sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ones_complement_sum() {
        // 0x4500 + 0x0073 + 0x0000 + 0x4000 + 0x4011 = 0xC584
        let data = [0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11];
        assert_eq!(ones_complement_sum(&data), 0xC584);

        // Odd length: 0x0102 + 0x0300
        assert_eq!(ones_complement_sum(&[0x01, 0x02, 0x03]), 0x0402);

        assert_eq!(ones_complement_sum(&[]), 0);
    }

    #[test]
    fn test_fold_checksum() {
        assert_eq!(fold_checksum(0x1_FFFF), 1);
        assert_eq!(fold_checksum(0x1_FFFE), 0xFFFF);
    }

    #[test]
    fn test_ipv4_header_checksum_known_vector() {
        // Classic example header, checksum 0xB861
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, // checksum = 0
            0xc0, 0xa8, 0x00, 0x01, // src: 192.168.0.1
            0xc0, 0xa8, 0x00, 0xc7, // dst: 192.168.0.199
        ];

        let checksum = ipv4_header_checksum(&header);
        assert_eq!(checksum, 0xB861);

        let mut with_checksum = header;
        with_checksum[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(fold_checksum(ones_complement_sum(&with_checksum)), 0xFFFF);
    }

    #[test]
    fn test_ipv4_pseudo_header_sum() {
        let sum = ipv4_pseudo_header_sum(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3), 17, 12);
        // 0x0a00 + 0x0001 + 0x0a00 + 0x0003 + 17 + 12
        assert_eq!(sum, 0x0a00 + 0x0001 + 0x0a00 + 0x0003 + 17 + 12);
    }

    #[test]
    fn test_ipv6_pseudo_header_sum() {
        let src: Ipv6Addr = "fd::1".parse().unwrap();
        let dst: Ipv6Addr = "fd::2".parse().unwrap();
        let sum = ipv6_pseudo_header_sum(src, dst, 6, 0x0001_0004);
        assert_eq!(sum, 0x00fd + 0x0001 + 0x00fd + 0x0002 + 0x0001 + 0x0004 + 6);
    }

    #[test]
    fn test_transport_checksum_verifies() {
        let src: IpAddr = "10.0.0.3".parse().unwrap();
        let dst: IpAddr = "10.0.0.1".parse().unwrap();
        // UDP header (ports 100 -> 200, length 12, zero checksum) + "abcd"
        let mut segment = vec![0, 100, 0, 200, 0, 12, 0, 0, b'a', b'b', b'c', b'd'];

        let checksum = transport_checksum(src, dst, 17, &segment).unwrap();
        segment[6..8].copy_from_slice(&checksum.to_be_bytes());

        // Summing again with the checksum in place yields all ones
        let (IpAddr::V4(s), IpAddr::V4(d)) = (src, dst) else {
            unreachable!()
        };
        let total = ipv4_pseudo_header_sum(s, d, 17, segment.len() as u16) + ones_complement_sum(&segment);
        assert_eq!(fold_checksum(total), 0xFFFF);
    }

    #[test]
    fn test_transport_checksum_rejects_mixed_families() {
        let src: IpAddr = "10.0.0.3".parse().unwrap();
        let dst: IpAddr = "fd::1".parse().unwrap();
        assert!(transport_checksum(src, dst, 6, &[0; 20]).is_none());
    }
}
