//! # OpenFlow 1.3 protocol layer
//!
//! The subset of OpenFlow 1.3 the controller speaks:
//! - Handshake and keep-alive (HELLO, FEATURES, ECHO)
//! - Asynchronous switch messages (PACKET_IN, FLOW_REMOVED, PORT_STATUS, ERROR)
//! - Controller commands (FLOW_MOD, PACKET_OUT)
//! - Multipart statistics (port stats, port description, flow stats, table stats)
//!
//! `model` holds the protocol structures; `codec` turns them into bytes and back.

pub mod codec;
pub mod model;

pub use codec::{frame_length, Message, MultipartReplyBody, MultipartRequest, WireError};
pub use model::{
    render_instructions, Action, FlowMatch, FlowMod, FlowRemoved, FlowRemovedReason, FlowStats,
    Instruction, PacketIn, PortDesc, PortReason, PortStats, PortStatus, SwitchFeatures, TableStats,
};

/// Protocol version byte for OpenFlow 1.3.
pub const OFP_VERSION: u8 = 0x04;

/// Size of the fixed `ofp_header`.
pub const OFP_HEADER_LEN: usize = 8;

/// Reserved port: all physical ports except the input port.
pub const OFPP_FLOOD: u32 = 0xffff_fffb;
/// Reserved port: send to the controller.
pub const OFPP_CONTROLLER: u32 = 0xffff_fffd;
/// Reserved port: wildcard.
pub const OFPP_ANY: u32 = 0xffff_ffff;

/// Wildcard group.
pub const OFPG_ANY: u32 = 0xffff_ffff;
/// All tables (flow stats request).
pub const OFPTT_ALL: u8 = 0xff;

/// Packet is not buffered on the switch.
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
/// Send the complete packet to the controller.
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

/// FLOW_MOD flag: send FLOW_REMOVED when the entry expires or is deleted.
pub const OFPFF_SEND_FLOW_REM: u16 = 1 << 0;

/// Multipart reply flag: more parts follow.
pub const OFPMPF_REPLY_MORE: u16 = 1 << 0;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
