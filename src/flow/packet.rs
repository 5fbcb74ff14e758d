//! Header extraction for packets escalated to the controller.
//!
//! Only the link layer is mandatory. Everything above it is best effort: a
//! truncated or unusual upper header yields a less specific shape, never an
//! error.

use crate::openflow::{ETH_TYPE_ARP, ETH_TYPE_IPV4, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::types::MacAddr;
use std::net::Ipv4Addr;

pub const ETH_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Closed set of packet shapes the classifier distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketShape {
    Arp,
    Tcp {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    },
    Udp {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    },
    /// IPv4 without usable transport ports (ICMP, other protocols, fragments).
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
    },
    /// Anything else carried in an Ethernet frame.
    Link,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPacket {
    pub eth_dst: MacAddr,
    pub eth_src: MacAddr,
    pub eth_type: u16,
    pub shape: PacketShape,
}

/// Parses an Ethernet frame. Fails only when the link-layer header is incomplete.
pub fn parse_frame(data: &[u8]) -> Result<ParsedPacket, String> {
    if data.len() < ETH_HEADER_LEN {
        return Err(format!(
            "frame of {} bytes is shorter than an Ethernet header",
            data.len()
        ));
    }

    let eth_dst = MacAddr::from_slice(&data[0..6])
        .ok_or_else(|| "missing destination address".to_string())?;
    let eth_src = MacAddr::from_slice(&data[6..12])
        .ok_or_else(|| "missing source address".to_string())?;
    let eth_type = u16::from_be_bytes([data[12], data[13]]);

    let shape = match eth_type {
        ETH_TYPE_ARP => PacketShape::Arp,
        ETH_TYPE_IPV4 => parse_ipv4(&data[ETH_HEADER_LEN..]),
        _ => PacketShape::Link,
    };

    Ok(ParsedPacket {
        eth_dst,
        eth_src,
        eth_type,
        shape,
    })
}

fn parse_ipv4(data: &[u8]) -> PacketShape {
    if data.len() < IPV4_MIN_HEADER_LEN || data[0] >> 4 != 4 {
        return PacketShape::Link;
    }

    let ihl = ((data[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_MIN_HEADER_LEN || ihl > data.len() {
        return PacketShape::Link;
    }

    let protocol = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    // Non-first fragments carry no transport header.
    let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
    let l4 = &data[ihl..];
    if fragment_offset != 0 || l4.len() < 4 {
        return PacketShape::Ipv4 { src, dst, protocol };
    }

    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);

    match protocol {
        IP_PROTO_TCP => PacketShape::Tcp {
            src,
            dst,
            src_port,
            dst_port,
        },
        IP_PROTO_UDP => PacketShape::Udp {
            src,
            dst,
            src_port,
            dst_port,
        },
        _ => PacketShape::Ipv4 { src, dst, protocol },
    }
}

/// Frame builders shared by unit tests, integration tests and benches.
pub mod build {
    use super::*;

    pub fn ethernet(dst: MacAddr, src: MacAddr, eth_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
        frame.extend_from_slice(&dst.octets());
        frame.extend_from_slice(&src.octets());
        frame.extend_from_slice(&eth_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4: &[u8]) -> Vec<u8> {
        let total_len = (IPV4_MIN_HEADER_LEN + l4.len()) as u16;
        let mut header = vec![0u8; IPV4_MIN_HEADER_LEN];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        header[8] = 64;
        header[9] = protocol;
        header[12..16].copy_from_slice(&src.octets());
        header[16..20].copy_from_slice(&dst.octets());
        header.extend_from_slice(l4);
        header
    }

    /// Minimal TCP header (20 bytes) with the SYN flag set.
    pub fn tcp_syn(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = 0x02;
        tcp
    }

    pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        udp.extend_from_slice(payload);
        udp
    }

    pub fn tcp_frame(
        eth_src: MacAddr,
        eth_dst: MacAddr,
        ip_src: Ipv4Addr,
        ip_dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        let ip = ipv4(ip_src, ip_dst, IP_PROTO_TCP, &tcp_syn(src_port, dst_port));
        ethernet(eth_dst, eth_src, ETH_TYPE_IPV4, &ip)
    }

    pub fn udp_frame(
        eth_src: MacAddr,
        eth_dst: MacAddr,
        ip_src: Ipv4Addr,
        ip_dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        let ip = ipv4(ip_src, ip_dst, IP_PROTO_UDP, &udp(src_port, dst_port, b"x"));
        ethernet(eth_dst, eth_src, ETH_TYPE_IPV4, &ip)
    }

    /// ICMP echo request.
    pub fn icmp_frame(eth_src: MacAddr, eth_dst: MacAddr, ip_src: Ipv4Addr, ip_dst: Ipv4Addr) -> Vec<u8> {
        let icmp = [8u8, 0, 0, 0, 0, 1, 0, 1];
        let ip = ipv4(ip_src, ip_dst, crate::openflow::IP_PROTO_ICMP, &icmp);
        ethernet(eth_dst, eth_src, ETH_TYPE_IPV4, &ip)
    }

    /// ARP request (28-byte payload).
    pub fn arp_frame(eth_src: MacAddr, eth_dst: MacAddr) -> Vec<u8> {
        let mut arp = vec![0u8; 28];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes());
        arp[2..4].copy_from_slice(&ETH_TYPE_IPV4.to_be_bytes());
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&1u16.to_be_bytes());
        arp[8..14].copy_from_slice(&eth_src.octets());
        ethernet(eth_dst, eth_src, ETH_TYPE_ARP, &arp)
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    const A: MacAddr = MacAddr([0, 0, 0, 0, 0xaa, 0xaa]);
    const B: MacAddr = MacAddr([0, 0, 0, 0, 0xbb, 0xbb]);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn test_runt_frame_rejected() {
        assert!(parse_frame(&[0u8; 13]).is_err());
        assert!(parse_frame(&[]).is_err());
    }

    #[test]
    fn test_tcp_shape() {
        let parsed = parse_frame(&tcp_frame(A, B, ip(1), ip(2), 51000, 80)).unwrap();
        assert_eq!(parsed.eth_src, A);
        assert_eq!(parsed.eth_dst, B);
        assert_eq!(parsed.eth_type, ETH_TYPE_IPV4);
        assert_eq!(
            parsed.shape,
            PacketShape::Tcp {
                src: ip(1),
                dst: ip(2),
                src_port: 51000,
                dst_port: 80
            }
        );
    }

    #[test]
    fn test_udp_icmp_arp_shapes() {
        let udp = parse_frame(&udp_frame(A, B, ip(1), ip(2), 5353, 53)).unwrap();
        assert!(matches!(udp.shape, PacketShape::Udp { dst_port: 53, .. }));

        let icmp = parse_frame(&icmp_frame(A, B, ip(1), ip(2))).unwrap();
        assert_eq!(
            icmp.shape,
            PacketShape::Ipv4 {
                src: ip(1),
                dst: ip(2),
                protocol: 1
            }
        );

        let arp = parse_frame(&arp_frame(A, MacAddr::BROADCAST)).unwrap();
        assert_eq!(arp.shape, PacketShape::Arp);
    }

    #[test]
    fn test_truncated_ipv4_degrades_to_link() {
        let frame = ethernet(B, A, ETH_TYPE_IPV4, &[0x45, 0, 0]);
        assert_eq!(parse_frame(&frame).unwrap().shape, PacketShape::Link);
    }

    #[test]
    fn test_missing_ports_degrades_to_ipv4() {
        let ip_only = ipv4(ip(1), ip(2), IP_PROTO_TCP, &[0x01, 0x02]);
        let frame = ethernet(B, A, ETH_TYPE_IPV4, &ip_only);
        assert!(matches!(
            parse_frame(&frame).unwrap().shape,
            PacketShape::Ipv4 { protocol: 6, .. }
        ));
    }

    #[test]
    fn test_non_first_fragment_has_no_ports() {
        let mut ip_packet = ipv4(ip(1), ip(2), IP_PROTO_UDP, &udp(1, 2, b"abc"));
        ip_packet[7] = 0x10; // fragment offset 16
        let frame = ethernet(B, A, ETH_TYPE_IPV4, &ip_packet);
        assert!(matches!(
            parse_frame(&frame).unwrap().shape,
            PacketShape::Ipv4 { protocol: 17, .. }
        ));
    }

    #[test]
    fn test_ipv6_is_link_shape() {
        let frame = ethernet(B, A, 0x86dd, &[0x60; 40]);
        assert_eq!(parse_frame(&frame).unwrap().shape, PacketShape::Link);
    }
}
