//! Match specificity and priority per packet shape.
//!
//! | Shape        | Priority | Match fields (besides in_port)                  |
//! |--------------|----------|-------------------------------------------------|
//! | ARP          | 15       | eth_type, eth_src, eth_dst                      |
//! | TCP over IP  | 30       | eth_type, ipv4 src/dst, ip_proto, tcp src/dst   |
//! | UDP over IP  | 30       | eth_type, ipv4 src/dst, ip_proto, udp src/dst   |
//! | other IP     | 25       | eth_type, ipv4 src/dst, ip_proto                |
//! | anything else| 10       | eth_src, eth_dst                                |
//!
//! Transport flows between the same two hosts get separate rules so their
//! counters stay separate in flow statistics.

use super::packet::{PacketShape, ParsedPacket};
use crate::openflow::{FlowMatch, ETH_TYPE_ARP, ETH_TYPE_IPV4, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::types::PortNo;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PRIORITY_TRANSPORT: u16 = 30;
pub const PRIORITY_IP: u16 = 25;
pub const PRIORITY_ARP: u16 = 15;
pub const PRIORITY_LINK: u16 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Arp,
    Tcp,
    Udp,
    Ip,
    Link,
}

impl Classification {
    pub fn priority(self) -> u16 {
        match self {
            Classification::Tcp | Classification::Udp => PRIORITY_TRANSPORT,
            Classification::Ip => PRIORITY_IP,
            Classification::Arp => PRIORITY_ARP,
            Classification::Link => PRIORITY_LINK,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Arp => "arp",
            Classification::Tcp => "tcp",
            Classification::Udp => "udp",
            Classification::Ip => "ip",
            Classification::Link => "link",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one packet: what to match and at which priority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowClass {
    pub classification: Classification,
    pub priority: u16,
    pub matcher: FlowMatch,
}

/// Classifies a parsed packet arriving on `in_port`.
pub fn classify(packet: &ParsedPacket, in_port: PortNo) -> FlowClass {
    let base = FlowMatch {
        in_port: Some(in_port),
        ..FlowMatch::default()
    };

    let (classification, matcher) = match packet.shape {
        PacketShape::Arp => (
            Classification::Arp,
            FlowMatch {
                eth_type: Some(ETH_TYPE_ARP),
                eth_src: Some(packet.eth_src),
                eth_dst: Some(packet.eth_dst),
                ..base
            },
        ),
        PacketShape::Tcp {
            src,
            dst,
            src_port,
            dst_port,
        } => (
            Classification::Tcp,
            FlowMatch {
                eth_type: Some(ETH_TYPE_IPV4),
                ip_proto: Some(IP_PROTO_TCP),
                ipv4_src: Some(src),
                ipv4_dst: Some(dst),
                tcp_src: Some(src_port),
                tcp_dst: Some(dst_port),
                ..base
            },
        ),
        PacketShape::Udp {
            src,
            dst,
            src_port,
            dst_port,
        } => (
            Classification::Udp,
            FlowMatch {
                eth_type: Some(ETH_TYPE_IPV4),
                ip_proto: Some(IP_PROTO_UDP),
                ipv4_src: Some(src),
                ipv4_dst: Some(dst),
                udp_src: Some(src_port),
                udp_dst: Some(dst_port),
                ..base
            },
        ),
        PacketShape::Ipv4 { src, dst, protocol } => (
            Classification::Ip,
            FlowMatch {
                eth_type: Some(ETH_TYPE_IPV4),
                ip_proto: Some(protocol),
                ipv4_src: Some(src),
                ipv4_dst: Some(dst),
                ..base
            },
        ),
        PacketShape::Link => (
            Classification::Link,
            FlowMatch {
                eth_src: Some(packet.eth_src),
                eth_dst: Some(packet.eth_dst),
                ..base
            },
        ),
    };

    FlowClass {
        classification,
        priority: classification.priority(),
        matcher,
    }
}
