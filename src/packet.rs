//! IPv4/TCP header access and checksum utilities.
//!
//! Packets handed over by the capture layer are raw IP datagrams (network
//! layer, no link header). Only the fields the redirect logic needs are
//! parsed; everything else is left untouched.

use std::net::Ipv4Addr;

const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const PROTO_TCP: u8 = 6;

/// Addresses and ports of an IPv4/TCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeaders {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the TCP header (IPv4 IHL * 4).
    pub ip_header_len: usize,
}

/// Parse the IPv4 and TCP headers of `data`. Returns `None` if the buffer is
/// not a complete IPv4/TCP packet.
pub fn parse_ipv4_tcp(data: &[u8]) -> Option<PacketHeaders> {
    if data.len() < IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN {
        return None;
    }

    let version = (data[0] >> 4) & 0xF;
    if version != 4 {
        return None;
    }

    let ihl = ((data[0] & 0xF) as usize) * 4;
    if ihl < IPV4_MIN_HEADER_LEN || data.len() < ihl + TCP_MIN_HEADER_LEN {
        return None;
    }
    if data[9] != PROTO_TCP {
        return None;
    }

    Some(PacketHeaders {
        src_addr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst_addr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        src_port: u16::from_be_bytes([data[ihl], data[ihl + 1]]),
        dst_port: u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]),
        ip_header_len: ihl,
    })
}

/// Overwrite the TCP source port. Checksums are stale afterwards.
pub fn set_tcp_src_port(packet: &mut [u8], headers: &PacketHeaders, port: u16) {
    let off = headers.ip_header_len;
    packet[off..off + 2].copy_from_slice(&port.to_be_bytes());
}

/// Overwrite the TCP destination port. Checksums are stale afterwards.
pub fn set_tcp_dst_port(packet: &mut [u8], headers: &PacketHeaders, port: u16) {
    let off = headers.ip_header_len + 2;
    packet[off..off + 2].copy_from_slice(&port.to_be_bytes());
}

// ============================================================================
// CHECKSUM UTILITIES
// ============================================================================

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Calculate IP header checksum (RFC 1071)
fn calculate_ip_checksum(header: &[u8]) -> u16 {
    fold(sum_words(header))
}

/// Calculate TCP checksum with pseudo-header (RFC 793)
fn calculate_tcp_checksum(packet: &[u8], ihl: usize) -> u16 {
    let tcp_segment = &packet[ihl..];

    let mut sum = sum_words(&packet[12..20]);
    sum += PROTO_TCP as u32;
    sum += tcp_segment.len() as u32;
    sum += sum_words(tcp_segment);
    fold(sum)
}

/// Recompute the IPv4 header and TCP checksums in place. Returns `false` if
/// the buffer is not an IPv4/TCP packet.
pub fn fix_packet_checksums(packet: &mut [u8]) -> bool {
    let ihl = match parse_ipv4_tcp(packet) {
        Some(headers) => headers.ip_header_len,
        None => return false,
    };

    packet[10] = 0;
    packet[11] = 0;
    let ip_checksum = calculate_ip_checksum(&packet[..ihl]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    packet[ihl + 16] = 0;
    packet[ihl + 17] = 0;
    let tcp_checksum = calculate_tcp_checksum(packet, ihl);
    packet[ihl + 16..ihl + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    true
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build an IPv4/TCP packet (ACK|PSH) with valid checksums.
    pub fn tcp_packet(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN + payload.len();
        let mut p = vec![0u8; total_len];

        p[0] = 0x45;
        p[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        p[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
        p[6] = 0x40;
        p[8] = 64;
        p[9] = PROTO_TCP;
        p[12..16].copy_from_slice(&src.octets());
        p[16..20].copy_from_slice(&dst.octets());

        let t = IPV4_MIN_HEADER_LEN;
        p[t..t + 2].copy_from_slice(&src_port.to_be_bytes());
        p[t + 2..t + 4].copy_from_slice(&dst_port.to_be_bytes());
        p[t + 4..t + 8].copy_from_slice(&1000u32.to_be_bytes());
        p[t + 8..t + 12].copy_from_slice(&2000u32.to_be_bytes());
        p[t + 12] = 5 << 4;
        p[t + 13] = 0x18;
        p[t + 14..t + 16].copy_from_slice(&64240u16.to_be_bytes());
        p[t + 20..].copy_from_slice(payload);

        assert!(fix_packet_checksums(&mut p));
        p
    }

    /// True if both the IPv4 header and TCP checksums verify.
    pub fn checksums_valid(packet: &[u8]) -> bool {
        let ihl = match parse_ipv4_tcp(packet) {
            Some(h) => h.ip_header_len,
            None => return false,
        };
        let ip_ok = fold(sum_words(&packet[..ihl])) == 0;

        let tcp = &packet[ihl..];
        let mut sum = sum_words(&packet[12..20]);
        sum += PROTO_TCP as u32;
        sum += tcp.len() as u32;
        sum += sum_words(tcp);
        ip_ok && fold(sum) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn test_parse_headers() {
        let p = tcp_packet(CLIENT, LOCAL, 50000, 80, b"hello");
        let h = parse_ipv4_tcp(&p).unwrap();
        assert_eq!(h.src_addr, CLIENT);
        assert_eq!(h.dst_addr, LOCAL);
        assert_eq!(h.src_port, 50000);
        assert_eq!(h.dst_port, 80);
        assert_eq!(h.ip_header_len, 20);
    }

    #[test]
    fn test_parse_rejects_non_tcp() {
        let mut p = tcp_packet(CLIENT, LOCAL, 50000, 80, b"");
        p[9] = 17;
        assert!(parse_ipv4_tcp(&p).is_none());

        let mut p = tcp_packet(CLIENT, LOCAL, 50000, 80, b"");
        p[0] = 0x65;
        assert!(parse_ipv4_tcp(&p).is_none());

        let p = tcp_packet(CLIENT, LOCAL, 50000, 80, b"");
        assert!(parse_ipv4_tcp(&p[..30]).is_none());
        assert!(parse_ipv4_tcp(&[]).is_none());
    }

    #[test]
    fn test_parse_honors_ip_options() {
        // IHL = 6: one 4-byte option word between the IP and TCP headers.
        let base = tcp_packet(CLIENT, LOCAL, 1234, 443, b"xy");
        let mut p = Vec::with_capacity(base.len() + 4);
        p.extend_from_slice(&base[..20]);
        p.extend_from_slice(&[1, 1, 1, 0]);
        p.extend_from_slice(&base[20..]);
        p[0] = 0x46;

        let h = parse_ipv4_tcp(&p).unwrap();
        assert_eq!(h.ip_header_len, 24);
        assert_eq!(h.src_port, 1234);
        assert_eq!(h.dst_port, 443);
        assert!(fix_packet_checksums(&mut p));
        assert!(checksums_valid(&p));
    }

    #[test]
    fn test_port_rewrite_then_fix_checksums() {
        let mut p = tcp_packet(CLIENT, LOCAL, 50000, 80, b"odd");
        let h = parse_ipv4_tcp(&p).unwrap();

        set_tcp_dst_port(&mut p, &h, 8080);
        assert!(!checksums_valid(&p));
        assert!(fix_packet_checksums(&mut p));
        assert!(checksums_valid(&p));

        let h = parse_ipv4_tcp(&p).unwrap();
        assert_eq!(h.dst_port, 8080);
        assert_eq!(h.src_port, 50000);

        set_tcp_src_port(&mut p, &h, 4242);
        assert!(fix_packet_checksums(&mut p));
        assert!(checksums_valid(&p));
        assert_eq!(parse_ipv4_tcp(&p).unwrap().src_port, 4242);
    }

    #[test]
    fn test_fix_checksums_rejects_garbage() {
        let mut junk = vec![0u8; 10];
        assert!(!fix_packet_checksums(&mut junk));
    }
}
