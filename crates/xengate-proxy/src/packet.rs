//! Minimal IPv4 packet handling for the TUN front-end
//!
//! Only what the TUN relay needs: pull addresses, ports and payload out of an
//! IPv4 TCP/UDP packet, and wrap returned bytes in a fresh IPv4 header.
//! Fragments, options on generated headers and ICMP are not handled.

use std::net::Ipv4Addr;
use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 20;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("Unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("Malformed header: {0}")]
    Malformed(&'static str),

    #[error("Payload of {0} bytes does not fit in an IPv4 packet")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn from_protocol(protocol: u8) -> Option<Self> {
        match protocol {
            PROTO_TCP => Some(Transport::Tcp),
            PROTO_UDP => Some(Transport::Udp),
            _ => None,
        }
    }

    pub fn protocol(self) -> u8 {
        match self {
            Transport::Tcp => PROTO_TCP,
            Transport::Udp => PROTO_UDP,
        }
    }
}

/// View into a parsed IPv4 TCP/UDP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub transport: Transport,
    pub src_port: u16,
    pub dst_port: u16,
    /// Bytes after the transport header
    pub payload: &'a [u8],
}

pub fn parse_ipv4(buf: &[u8]) -> Result<Ipv4Packet<'_>, PacketError> {
    if buf.len() < IPV4_HEADER_LEN {
        return Err(PacketError::TooShort(buf.len()));
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }

    let header_len = usize::from(buf[0] & 0x0f) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > buf.len() {
        return Err(PacketError::Malformed("invalid header length"));
    }

    // Trailing link padding is ignored
    let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if total_len < header_len {
        return Err(PacketError::Malformed("total length shorter than header"));
    }
    let end = total_len.min(buf.len());

    let protocol = buf[9];
    let transport =
        Transport::from_protocol(protocol).ok_or(PacketError::UnsupportedProtocol(protocol))?;

    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

    let segment = &buf[header_len..end];
    let transport_len = match transport {
        Transport::Tcp => {
            if segment.len() < TCP_MIN_HEADER_LEN {
                return Err(PacketError::Malformed("truncated TCP header"));
            }
            let data_offset = usize::from(segment[12] >> 4) * 4;
            if data_offset < TCP_MIN_HEADER_LEN || data_offset > segment.len() {
                return Err(PacketError::Malformed("invalid TCP data offset"));
            }
            data_offset
        }
        Transport::Udp => {
            if segment.len() < UDP_HEADER_LEN {
                return Err(PacketError::Malformed("truncated UDP header"));
            }
            UDP_HEADER_LEN
        }
    };

    Ok(Ipv4Packet {
        src,
        dst,
        transport,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        payload: &segment[transport_len..],
    })
}

/// One's-complement sum of 16-bit big-endian words, carries folded
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|word| match word {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

pub fn ipv4_checksum(header: &[u8]) -> u16 {
    !ones_complement_sum(header)
}

/// 20-byte IPv4 header with no options, TTL 64 and a valid checksum
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    total_len: u16,
) -> [u8; IPV4_HEADER_LEN] {
    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[8] = DEFAULT_TTL;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let checksum = ipv4_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    header
}

/// Prefix `payload` with an IPv4 header from `src` to `dst`
pub fn wrap_payload(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let total_len = u16::try_from(IPV4_HEADER_LEN + payload.len())
        .map_err(|_| PacketError::PayloadTooLarge(payload.len()))?;

    let mut packet = Vec::with_capacity(usize::from(total_len));
    packet.extend_from_slice(&build_ipv4_header(src, dst, protocol, total_len));
    packet.extend_from_slice(payload);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn tcp_packet(payload: &[u8]) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&40000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp.extend_from_slice(payload);
        wrap_payload(CLIENT, SERVER, PROTO_TCP, &tcp).unwrap()
    }

    #[test]
    fn test_header_checksum_folds_to_all_ones() {
        let header = build_ipv4_header(SERVER, CLIENT, PROTO_TCP, 60);
        assert_eq!(ones_complement_sum(&header), 0xffff);
        assert_eq!(ipv4_checksum(&header), 0);
    }

    #[test]
    fn test_known_checksum() {
        // Classic worked example header
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_checksum(&header), 0xb861);
    }

    #[test]
    fn test_header_fields() {
        let header = build_ipv4_header(SERVER, CLIENT, PROTO_UDP, 48);
        assert_eq!(header[0], 0x45);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 48);
        assert_eq!(header[8], 64);
        assert_eq!(header[9], PROTO_UDP);
        assert_eq!(&header[12..16], &SERVER.octets());
        assert_eq!(&header[16..20], &CLIENT.octets());
    }

    #[test]
    fn test_parse_tcp_extracts_payload() {
        let packet = tcp_packet(b"GET / HTTP/1.1\r\n\r\n");
        let parsed = parse_ipv4(&packet).unwrap();

        assert_eq!(parsed.src, CLIENT);
        assert_eq!(parsed.dst, SERVER);
        assert_eq!(parsed.transport, Transport::Tcp);
        assert_eq!(parsed.src_port, 40000);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.payload, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_parse_tcp_with_options() {
        let mut tcp = vec![0u8; 24];
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        tcp[12] = 6 << 4;
        tcp.extend_from_slice(b"hi");
        let packet = wrap_payload(CLIENT, SERVER, PROTO_TCP, &tcp).unwrap();

        let parsed = parse_ipv4(&packet).unwrap();
        assert_eq!(parsed.dst_port, 443);
        assert_eq!(parsed.payload, b"hi");
    }

    #[test]
    fn test_parse_udp() {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&5353u16.to_be_bytes());
        udp[2..4].copy_from_slice(&53u16.to_be_bytes());
        udp.extend_from_slice(b"query");
        let packet = wrap_payload(CLIENT, SERVER, PROTO_UDP, &udp).unwrap();

        let parsed = parse_ipv4(&packet).unwrap();
        assert_eq!(parsed.transport, Transport::Udp);
        assert_eq!(parsed.src_port, 5353);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(parsed.payload, b"query");
    }

    #[test]
    fn test_trailing_padding_is_ignored() {
        let mut packet = tcp_packet(b"abc");
        packet.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(parse_ipv4(&packet).unwrap().payload, b"abc");
    }

    #[test]
    fn test_rejects_non_ipv4_and_short_packets() {
        assert_eq!(parse_ipv4(&[0x45; 10]), Err(PacketError::TooShort(10)));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        assert_eq!(parse_ipv4(&v6), Err(PacketError::NotIpv4(6)));
    }

    #[test]
    fn test_rejects_other_protocols() {
        let icmp = wrap_payload(CLIENT, SERVER, 1, &[8, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(parse_ipv4(&icmp), Err(PacketError::UnsupportedProtocol(1)));
    }

    #[test]
    fn test_truncated_transport_header() {
        let packet = wrap_payload(CLIENT, SERVER, PROTO_TCP, &[0u8; 10]).unwrap();
        assert!(matches!(parse_ipv4(&packet), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn test_wrap_payload_rejects_oversized() {
        let payload = vec![0u8; 65536];
        assert_eq!(
            wrap_payload(SERVER, CLIENT, PROTO_TCP, &payload),
            Err(PacketError::PayloadTooLarge(65536))
        );
    }
}
