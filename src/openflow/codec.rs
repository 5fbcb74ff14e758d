//! OpenFlow 1.3 wire codec.
//!
//! Every message is an 8-byte `ofp_header` (version, type, length, xid)
//! followed by a type-specific body. `frame_length` lets the transport read
//! exactly one message; `Message::decode` / `Message::encode` do the rest.

use super::model::{
    Action, FlowMatch, FlowMod, FlowRemoved, FlowStats, Instruction, PacketIn, PortDesc, PortStats,
    PortStatus, SwitchFeatures, TableStats,
};
use super::{OFPP_ANY, OFPG_ANY, OFPTT_ALL, OFP_HEADER_LEN, OFP_VERSION};
use crate::types::MacAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

// Message types
const OFPT_HELLO: u8 = 0;
const OFPT_ERROR: u8 = 1;
const OFPT_ECHO_REQUEST: u8 = 2;
const OFPT_ECHO_REPLY: u8 = 3;
const OFPT_FEATURES_REQUEST: u8 = 5;
const OFPT_FEATURES_REPLY: u8 = 6;
const OFPT_PACKET_IN: u8 = 10;
const OFPT_FLOW_REMOVED: u8 = 11;
const OFPT_PORT_STATUS: u8 = 12;
const OFPT_PACKET_OUT: u8 = 13;
const OFPT_FLOW_MOD: u8 = 14;
const OFPT_MULTIPART_REQUEST: u8 = 18;
const OFPT_MULTIPART_REPLY: u8 = 19;

// Multipart types
const OFPMP_FLOW: u16 = 1;
const OFPMP_TABLE: u16 = 3;
const OFPMP_PORT_STATS: u16 = 4;
const OFPMP_PORT_DESC: u16 = 13;

// Match / OXM
const OFPMT_OXM: u16 = 1;
const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;
const OXM_IN_PORT: u8 = 0;
const OXM_ETH_DST: u8 = 3;
const OXM_ETH_SRC: u8 = 4;
const OXM_ETH_TYPE: u8 = 5;
const OXM_IP_PROTO: u8 = 10;
const OXM_IPV4_SRC: u8 = 11;
const OXM_IPV4_DST: u8 = 12;
const OXM_TCP_SRC: u8 = 13;
const OXM_TCP_DST: u8 = 14;
const OXM_UDP_SRC: u8 = 15;
const OXM_UDP_DST: u8 = 16;

// Instructions / actions
const OFPIT_GOTO_TABLE: u16 = 1;
const OFPIT_APPLY_ACTIONS: u16 = 4;
const OFPAT_OUTPUT: u16 = 0;

const OFPFC_ADD: u8 = 0;

const PORT_DESC_LEN: usize = 64;
const PORT_STATS_LEN: usize = 112;
const TABLE_STATS_LEN: usize = 24;
const FLOW_STATS_FIXED_LEN: usize = 48;
const PORT_NAME_LEN: usize = 16;

/// Codec failures.
///
/// `Truncated`, `BadLength` and `UnsupportedVersion` in a header mean the
/// byte stream can no longer be trusted; inside a body they only spoil the
/// one message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported protocol version 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("invalid length {length} for {what}")]
    BadLength { what: &'static str, length: usize },

    #[error("unknown message type {0}")]
    UnknownMessage(u8),
}

/// Reads the total message length from an `ofp_header`.
pub fn frame_length(header: &[u8; OFP_HEADER_LEN]) -> Result<usize, WireError> {
    if header[0] != OFP_VERSION {
        return Err(WireError::UnsupportedVersion(header[0]));
    }
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < OFP_HEADER_LEN {
        return Err(WireError::BadLength {
            what: "ofp_header",
            length,
        });
    }
    Ok(length)
}

// ================================================================================================
// MESSAGES
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultipartRequest {
    PortStats { port_no: u32 },
    PortDesc,
    Flow {
        table_id: u8,
        out_port: u32,
        out_group: u32,
        cookie: u64,
        cookie_mask: u64,
        matcher: FlowMatch,
    },
    Table,
}

impl MultipartRequest {
    /// Flow stats for every entry in every table.
    pub fn all_flows() -> Self {
        MultipartRequest::Flow {
            table_id: OFPTT_ALL,
            out_port: OFPP_ANY,
            out_group: OFPG_ANY,
            cookie: 0,
            cookie_mask: 0,
            matcher: FlowMatch::any(),
        }
    }

    /// Port stats for every port.
    pub fn all_ports() -> Self {
        MultipartRequest::PortStats { port_no: OFPP_ANY }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultipartReplyBody {
    PortStats(Vec<PortStats>),
    PortDesc(Vec<PortDesc>),
    Flow(Vec<FlowStats>),
    Table(Vec<TableStats>),
    Other { multipart_type: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Hello,
    Error { error_type: u16, code: u16, data: Vec<u8> },
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesRequest,
    FeaturesReply(SwitchFeatures),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut { buffer_id: u32, in_port: u32, actions: Vec<Action>, data: Vec<u8> },
    FlowMod(FlowMod),
    MultipartRequest(MultipartRequest),
    MultipartReply { flags: u16, body: MultipartReplyBody },
    /// A well-formed message of a type the controller does not handle.
    Unhandled { msg_type: u8 },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello => "HELLO",
            Message::Error { .. } => "ERROR",
            Message::EchoRequest(_) => "ECHO_REQUEST",
            Message::EchoReply(_) => "ECHO_REPLY",
            Message::FeaturesRequest => "FEATURES_REQUEST",
            Message::FeaturesReply(_) => "FEATURES_REPLY",
            Message::PacketIn(_) => "PACKET_IN",
            Message::FlowRemoved(_) => "FLOW_REMOVED",
            Message::PortStatus(_) => "PORT_STATUS",
            Message::PacketOut { .. } => "PACKET_OUT",
            Message::FlowMod(_) => "FLOW_MOD",
            Message::MultipartRequest(_) => "MULTIPART_REQUEST",
            Message::MultipartReply { .. } => "MULTIPART_REPLY",
            Message::Unhandled { .. } => "UNHANDLED",
        }
    }

    /// Decodes one complete message (header included). Returns the xid and message.
    pub fn decode(frame: &[u8]) -> Result<(u32, Message), WireError> {
        let mut r = Reader::new(frame);
        let version = r.u8()?;
        if version != OFP_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let msg_type = r.u8()?;
        let length = r.u16()? as usize;
        let xid = r.u32()?;
        if length < OFP_HEADER_LEN || length > frame.len() {
            return Err(WireError::BadLength {
                what: "ofp_header",
                length,
            });
        }
        let mut body = Reader::new(&frame[OFP_HEADER_LEN..length]);

        let message = match msg_type {
            OFPT_HELLO => Message::Hello,
            OFPT_ERROR => Message::Error {
                error_type: body.u16()?,
                code: body.u16()?,
                data: body.rest(),
            },
            OFPT_ECHO_REQUEST => Message::EchoRequest(body.rest()),
            OFPT_ECHO_REPLY => Message::EchoReply(body.rest()),
            OFPT_FEATURES_REQUEST => Message::FeaturesRequest,
            OFPT_FEATURES_REPLY => {
                let datapath_id = body.u64()?;
                let n_buffers = body.u32()?;
                let n_tables = body.u8()?;
                let auxiliary_id = body.u8()?;
                body.skip(2)?;
                let capabilities = body.u32()?;
                Message::FeaturesReply(SwitchFeatures {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    auxiliary_id,
                    capabilities,
                })
            }
            OFPT_PACKET_IN => {
                let buffer_id = body.u32()?;
                let total_len = body.u16()?;
                let reason = body.u8()?;
                let table_id = body.u8()?;
                let cookie = body.u64()?;
                let matcher = decode_match(&mut body)?;
                body.skip(2)?;
                Message::PacketIn(PacketIn {
                    buffer_id,
                    total_len,
                    reason,
                    table_id,
                    cookie,
                    matcher,
                    data: body.rest(),
                })
            }
            OFPT_FLOW_REMOVED => Message::FlowRemoved(FlowRemoved {
                cookie: body.u64()?,
                priority: body.u16()?,
                reason: body.u8()?.into(),
                table_id: body.u8()?,
                duration_sec: body.u32()?,
                duration_nsec: body.u32()?,
                idle_timeout: body.u16()?,
                hard_timeout: body.u16()?,
                packet_count: body.u64()?,
                byte_count: body.u64()?,
                matcher: decode_match(&mut body)?,
            }),
            OFPT_PORT_STATUS => {
                let reason = body.u8()?.into();
                body.skip(7)?;
                Message::PortStatus(PortStatus {
                    reason,
                    desc: decode_port_desc(&mut body)?,
                })
            }
            OFPT_PACKET_OUT => {
                let buffer_id = body.u32()?;
                let in_port = body.u32()?;
                let actions_len = body.u16()? as usize;
                body.skip(6)?;
                let mut actions_reader = body.sub(actions_len)?;
                let actions = decode_actions(&mut actions_reader)?;
                Message::PacketOut {
                    buffer_id,
                    in_port,
                    actions,
                    data: body.rest(),
                }
            }
            OFPT_FLOW_MOD => {
                let cookie = body.u64()?;
                body.skip(8)?; // cookie_mask
                let table_id = body.u8()?;
                body.skip(1)?; // command
                let idle_timeout = body.u16()?;
                let hard_timeout = body.u16()?;
                let priority = body.u16()?;
                let buffer_id = body.u32()?;
                body.skip(8)?; // out_port, out_group
                let flags = body.u16()?;
                body.skip(2)?;
                let matcher = decode_match(&mut body)?;
                let instructions = decode_instructions(&mut body)?;
                Message::FlowMod(FlowMod {
                    cookie,
                    table_id,
                    idle_timeout,
                    hard_timeout,
                    priority,
                    buffer_id,
                    flags,
                    matcher,
                    instructions,
                })
            }
            OFPT_MULTIPART_REQUEST => {
                let multipart_type = body.u16()?;
                body.skip(6)?; // flags + pad
                let request = match multipart_type {
                    OFPMP_PORT_STATS => {
                        let port_no = body.u32()?;
                        MultipartRequest::PortStats { port_no }
                    }
                    OFPMP_PORT_DESC => MultipartRequest::PortDesc,
                    OFPMP_TABLE => MultipartRequest::Table,
                    OFPMP_FLOW => {
                        let table_id = body.u8()?;
                        body.skip(3)?;
                        let out_port = body.u32()?;
                        let out_group = body.u32()?;
                        body.skip(4)?;
                        let cookie = body.u64()?;
                        let cookie_mask = body.u64()?;
                        let matcher = decode_match(&mut body)?;
                        MultipartRequest::Flow {
                            table_id,
                            out_port,
                            out_group,
                            cookie,
                            cookie_mask,
                            matcher,
                        }
                    }
                    _ => return Ok((xid, Message::Unhandled { msg_type })),
                };
                Message::MultipartRequest(request)
            }
            OFPT_MULTIPART_REPLY => {
                let multipart_type = body.u16()?;
                let flags = body.u16()?;
                body.skip(4)?;
                Message::MultipartReply {
                    flags,
                    body: decode_multipart_reply(multipart_type, &mut body)?,
                }
            }
            other if other <= 29 => Message::Unhandled { msg_type: other },
            other => return Err(WireError::UnknownMessage(other)),
        };

        Ok((xid, message))
    }

    /// Encodes the message with the given transaction id.
    pub fn encode(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(OFP_VERSION);
        buf.put_u8(self.type_code());
        buf.put_u16(0); // patched below
        buf.put_u32(xid);

        match self {
            Message::Hello | Message::FeaturesRequest | Message::Unhandled { .. } => {}
            Message::Error { error_type, code, data } => {
                buf.put_u16(*error_type);
                buf.put_u16(*code);
                buf.put_slice(data);
            }
            Message::EchoRequest(data) | Message::EchoReply(data) => buf.put_slice(data),
            Message::FeaturesReply(features) => {
                buf.put_u64(features.datapath_id);
                buf.put_u32(features.n_buffers);
                buf.put_u8(features.n_tables);
                buf.put_u8(features.auxiliary_id);
                buf.put_bytes(0, 2);
                buf.put_u32(features.capabilities);
                buf.put_u32(0);
            }
            Message::PacketIn(packet_in) => {
                buf.put_u32(packet_in.buffer_id);
                buf.put_u16(packet_in.total_len);
                buf.put_u8(packet_in.reason);
                buf.put_u8(packet_in.table_id);
                buf.put_u64(packet_in.cookie);
                encode_match(&mut buf, &packet_in.matcher);
                buf.put_bytes(0, 2);
                buf.put_slice(&packet_in.data);
            }
            Message::FlowRemoved(removed) => {
                buf.put_u64(removed.cookie);
                buf.put_u16(removed.priority);
                buf.put_u8(removed.reason.into());
                buf.put_u8(removed.table_id);
                buf.put_u32(removed.duration_sec);
                buf.put_u32(removed.duration_nsec);
                buf.put_u16(removed.idle_timeout);
                buf.put_u16(removed.hard_timeout);
                buf.put_u64(removed.packet_count);
                buf.put_u64(removed.byte_count);
                encode_match(&mut buf, &removed.matcher);
            }
            Message::PortStatus(status) => {
                buf.put_u8(status.reason.into());
                buf.put_bytes(0, 7);
                encode_port_desc(&mut buf, &status.desc);
            }
            Message::PacketOut { buffer_id, in_port, actions, data } => {
                buf.put_u32(*buffer_id);
                buf.put_u32(*in_port);
                let mut encoded_actions = BytesMut::new();
                for action in actions {
                    encode_action(&mut encoded_actions, action);
                }
                buf.put_u16(encoded_actions.len() as u16);
                buf.put_bytes(0, 6);
                buf.put_slice(&encoded_actions);
                buf.put_slice(data);
            }
            Message::FlowMod(flow_mod) => {
                buf.put_u64(flow_mod.cookie);
                buf.put_u64(0); // cookie_mask
                buf.put_u8(flow_mod.table_id);
                buf.put_u8(OFPFC_ADD);
                buf.put_u16(flow_mod.idle_timeout);
                buf.put_u16(flow_mod.hard_timeout);
                buf.put_u16(flow_mod.priority);
                buf.put_u32(flow_mod.buffer_id);
                buf.put_u32(OFPP_ANY);
                buf.put_u32(OFPG_ANY);
                buf.put_u16(flow_mod.flags);
                buf.put_bytes(0, 2);
                encode_match(&mut buf, &flow_mod.matcher);
                for instruction in &flow_mod.instructions {
                    encode_instruction(&mut buf, instruction);
                }
            }
            Message::MultipartRequest(request) => encode_multipart_request(&mut buf, request),
            Message::MultipartReply { flags, body } => encode_multipart_reply(&mut buf, *flags, body),
        }

        let length = buf.len() as u16;
        buf[2..4].copy_from_slice(&length.to_be_bytes());
        buf.freeze()
    }

    fn type_code(&self) -> u8 {
        match self {
            Message::Hello => OFPT_HELLO,
            Message::Error { .. } => OFPT_ERROR,
            Message::EchoRequest(_) => OFPT_ECHO_REQUEST,
            Message::EchoReply(_) => OFPT_ECHO_REPLY,
            Message::FeaturesRequest => OFPT_FEATURES_REQUEST,
            Message::FeaturesReply(_) => OFPT_FEATURES_REPLY,
            Message::PacketIn(_) => OFPT_PACKET_IN,
            Message::FlowRemoved(_) => OFPT_FLOW_REMOVED,
            Message::PortStatus(_) => OFPT_PORT_STATUS,
            Message::PacketOut { .. } => OFPT_PACKET_OUT,
            Message::FlowMod(_) => OFPT_FLOW_MOD,
            Message::MultipartRequest(_) => OFPT_MULTIPART_REQUEST,
            Message::MultipartReply { .. } => OFPT_MULTIPART_REPLY,
            Message::Unhandled { msg_type } => *msg_type,
        }
    }
}

// ================================================================================================
// READER
// ================================================================================================

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Splits off the next `n` bytes as an independent reader.
    fn sub(&mut self, n: usize) -> Result<Reader<'a>, WireError> {
        Ok(Reader::new(self.bytes(n)?))
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf = &[];
        out
    }
}

// ================================================================================================
// MATCH
// ================================================================================================

fn padding_for(len: usize) -> usize {
    (8 - len % 8) % 8
}

fn put_oxm(buf: &mut BytesMut, field: u8, value: &[u8]) {
    let header = ((OFPXMC_OPENFLOW_BASIC as u32) << 16) | ((field as u32) << 9) | value.len() as u32;
    buf.put_u32(header);
    buf.put_slice(value);
}

fn encode_match(buf: &mut BytesMut, m: &FlowMatch) {
    let mut oxm = BytesMut::new();
    if let Some(v) = m.in_port {
        put_oxm(&mut oxm, OXM_IN_PORT, &v.to_be_bytes());
    }
    if let Some(v) = m.eth_dst {
        put_oxm(&mut oxm, OXM_ETH_DST, &v.octets());
    }
    if let Some(v) = m.eth_src {
        put_oxm(&mut oxm, OXM_ETH_SRC, &v.octets());
    }
    if let Some(v) = m.eth_type {
        put_oxm(&mut oxm, OXM_ETH_TYPE, &v.to_be_bytes());
    }
    if let Some(v) = m.ip_proto {
        put_oxm(&mut oxm, OXM_IP_PROTO, &[v]);
    }
    if let Some(v) = m.ipv4_src {
        put_oxm(&mut oxm, OXM_IPV4_SRC, &v.octets());
    }
    if let Some(v) = m.ipv4_dst {
        put_oxm(&mut oxm, OXM_IPV4_DST, &v.octets());
    }
    if let Some(v) = m.tcp_src {
        put_oxm(&mut oxm, OXM_TCP_SRC, &v.to_be_bytes());
    }
    if let Some(v) = m.tcp_dst {
        put_oxm(&mut oxm, OXM_TCP_DST, &v.to_be_bytes());
    }
    if let Some(v) = m.udp_src {
        put_oxm(&mut oxm, OXM_UDP_SRC, &v.to_be_bytes());
    }
    if let Some(v) = m.udp_dst {
        put_oxm(&mut oxm, OXM_UDP_DST, &v.to_be_bytes());
    }

    let length = 4 + oxm.len();
    buf.put_u16(OFPMT_OXM);
    buf.put_u16(length as u16);
    buf.put_slice(&oxm);
    buf.put_bytes(0, padding_for(length));
}

fn be_u16(value: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(value.try_into().ok()?))
}

fn be_ipv4(value: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = value.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn decode_match(r: &mut Reader<'_>) -> Result<FlowMatch, WireError> {
    let match_type = r.u16()?;
    let length = r.u16()? as usize;
    if length < 4 {
        return Err(WireError::BadLength {
            what: "ofp_match",
            length,
        });
    }
    let mut fields = r.sub(length - 4)?;
    let padding = padding_for(length).min(r.remaining());
    r.skip(padding)?;

    let mut m = FlowMatch::default();
    if match_type != OFPMT_OXM {
        return Ok(m);
    }

    while fields.remaining() >= 4 {
        let header = fields.u32()?;
        let class = (header >> 16) as u16;
        let field = ((header >> 9) & 0x7f) as u8;
        let has_mask = (header >> 8) & 1 == 1;
        let len = (header & 0xff) as usize;
        let value = fields.bytes(len)?;

        // Masked and experimenter fields are never installed by this controller.
        if class != OFPXMC_OPENFLOW_BASIC || has_mask {
            continue;
        }
        match field {
            OXM_IN_PORT => m.in_port = value.try_into().ok().map(u32::from_be_bytes),
            OXM_ETH_DST => m.eth_dst = MacAddr::from_slice(value),
            OXM_ETH_SRC => m.eth_src = MacAddr::from_slice(value),
            OXM_ETH_TYPE => m.eth_type = be_u16(value),
            OXM_IP_PROTO => m.ip_proto = value.first().copied(),
            OXM_IPV4_SRC => m.ipv4_src = be_ipv4(value),
            OXM_IPV4_DST => m.ipv4_dst = be_ipv4(value),
            OXM_TCP_SRC => m.tcp_src = be_u16(value),
            OXM_TCP_DST => m.tcp_dst = be_u16(value),
            OXM_UDP_SRC => m.udp_src = be_u16(value),
            OXM_UDP_DST => m.udp_dst = be_u16(value),
            _ => {}
        }
    }
    Ok(m)
}

// ================================================================================================
// ACTIONS & INSTRUCTIONS
// ================================================================================================

fn encode_action(buf: &mut BytesMut, action: &Action) {
    match action {
        Action::Output { port, max_len } => {
            buf.put_u16(OFPAT_OUTPUT);
            buf.put_u16(16);
            buf.put_u32(*port);
            buf.put_u16(*max_len);
            buf.put_bytes(0, 6);
        }
        Action::Other { action_type } => {
            buf.put_u16(*action_type);
            buf.put_u16(8);
            buf.put_bytes(0, 4);
        }
    }
}

fn decode_actions(r: &mut Reader<'_>) -> Result<Vec<Action>, WireError> {
    let mut actions = Vec::new();
    while r.remaining() >= 4 {
        let action_type = r.u16()?;
        let len = r.u16()? as usize;
        if len < 8 {
            return Err(WireError::BadLength {
                what: "ofp_action",
                length: len,
            });
        }
        let mut body = r.sub(len - 4)?;
        if action_type == OFPAT_OUTPUT {
            let port = body.u32()?;
            let max_len = body.u16()?;
            actions.push(Action::Output { port, max_len });
        } else {
            actions.push(Action::Other { action_type });
        }
    }
    Ok(actions)
}

fn encode_instruction(buf: &mut BytesMut, instruction: &Instruction) {
    match instruction {
        Instruction::GotoTable(table_id) => {
            buf.put_u16(OFPIT_GOTO_TABLE);
            buf.put_u16(8);
            buf.put_u8(*table_id);
            buf.put_bytes(0, 3);
        }
        Instruction::ApplyActions(actions) => {
            let mut encoded = BytesMut::new();
            for action in actions {
                encode_action(&mut encoded, action);
            }
            buf.put_u16(OFPIT_APPLY_ACTIONS);
            buf.put_u16((8 + encoded.len()) as u16);
            buf.put_bytes(0, 4);
            buf.put_slice(&encoded);
        }
        Instruction::Other { instruction_type } => {
            buf.put_u16(*instruction_type);
            buf.put_u16(8);
            buf.put_bytes(0, 4);
        }
    }
}

fn decode_instructions(r: &mut Reader<'_>) -> Result<Vec<Instruction>, WireError> {
    let mut instructions = Vec::new();
    while r.remaining() >= 4 {
        let instruction_type = r.u16()?;
        let len = r.u16()? as usize;
        if len < 8 {
            return Err(WireError::BadLength {
                what: "ofp_instruction",
                length: len,
            });
        }
        let mut body = r.sub(len - 4)?;
        let instruction = match instruction_type {
            OFPIT_GOTO_TABLE => Instruction::GotoTable(body.u8()?),
            OFPIT_APPLY_ACTIONS => {
                body.skip(4)?;
                Instruction::ApplyActions(decode_actions(&mut body)?)
            }
            other => Instruction::Other {
                instruction_type: other,
            },
        };
        instructions.push(instruction);
    }
    Ok(instructions)
}

// ================================================================================================
// PORTS
// ================================================================================================

fn encode_port_desc(buf: &mut BytesMut, port: &PortDesc) {
    buf.put_u32(port.port_no);
    buf.put_bytes(0, 4);
    buf.put_slice(&port.hw_addr.octets());
    buf.put_bytes(0, 2);
    let mut name = [0u8; PORT_NAME_LEN];
    let raw = port.name.as_bytes();
    let n = raw.len().min(PORT_NAME_LEN - 1);
    name[..n].copy_from_slice(&raw[..n]);
    buf.put_slice(&name);
    for v in [
        port.config,
        port.state,
        port.curr,
        port.advertised,
        port.supported,
        port.peer,
        port.curr_speed,
        port.max_speed,
    ] {
        buf.put_u32(v);
    }
}

fn decode_port_desc(r: &mut Reader<'_>) -> Result<PortDesc, WireError> {
    let mut p = r.sub(PORT_DESC_LEN)?;
    let port_no = p.u32()?;
    p.skip(4)?;
    let hw_addr = MacAddr::from_slice(p.bytes(6)?).unwrap_or_default();
    p.skip(2)?;
    let raw_name = p.bytes(PORT_NAME_LEN)?;
    let end = raw_name.iter().position(|b| *b == 0).unwrap_or(PORT_NAME_LEN);
    let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
    Ok(PortDesc {
        port_no,
        hw_addr,
        name,
        config: p.u32()?,
        state: p.u32()?,
        curr: p.u32()?,
        advertised: p.u32()?,
        supported: p.u32()?,
        peer: p.u32()?,
        curr_speed: p.u32()?,
        max_speed: p.u32()?,
    })
}

// ================================================================================================
// MULTIPART
// ================================================================================================

fn encode_multipart_request(buf: &mut BytesMut, request: &MultipartRequest) {
    let multipart_type = match request {
        MultipartRequest::PortStats { .. } => OFPMP_PORT_STATS,
        MultipartRequest::PortDesc => OFPMP_PORT_DESC,
        MultipartRequest::Flow { .. } => OFPMP_FLOW,
        MultipartRequest::Table => OFPMP_TABLE,
    };
    buf.put_u16(multipart_type);
    buf.put_u16(0);
    buf.put_bytes(0, 4);

    match request {
        MultipartRequest::PortStats { port_no } => {
            buf.put_u32(*port_no);
            buf.put_bytes(0, 4);
        }
        MultipartRequest::Flow {
            table_id,
            out_port,
            out_group,
            cookie,
            cookie_mask,
            matcher,
        } => {
            buf.put_u8(*table_id);
            buf.put_bytes(0, 3);
            buf.put_u32(*out_port);
            buf.put_u32(*out_group);
            buf.put_bytes(0, 4);
            buf.put_u64(*cookie);
            buf.put_u64(*cookie_mask);
            encode_match(buf, matcher);
        }
        MultipartRequest::PortDesc | MultipartRequest::Table => {}
    }
}

fn encode_multipart_reply(buf: &mut BytesMut, flags: u16, body: &MultipartReplyBody) {
    let multipart_type = match body {
        MultipartReplyBody::PortStats(_) => OFPMP_PORT_STATS,
        MultipartReplyBody::PortDesc(_) => OFPMP_PORT_DESC,
        MultipartReplyBody::Flow(_) => OFPMP_FLOW,
        MultipartReplyBody::Table(_) => OFPMP_TABLE,
        MultipartReplyBody::Other { multipart_type } => *multipart_type,
    };
    buf.put_u16(multipart_type);
    buf.put_u16(flags);
    buf.put_bytes(0, 4);

    match body {
        MultipartReplyBody::PortStats(stats) => {
            for s in stats {
                buf.put_u32(s.port_no);
                buf.put_bytes(0, 4);
                for v in [
                    s.rx_packets,
                    s.tx_packets,
                    s.rx_bytes,
                    s.tx_bytes,
                    s.rx_dropped,
                    s.tx_dropped,
                    s.rx_errors,
                    s.tx_errors,
                    s.rx_frame_err,
                    s.rx_over_err,
                    s.rx_crc_err,
                    s.collisions,
                ] {
                    buf.put_u64(v);
                }
                buf.put_u32(s.duration_sec);
                buf.put_u32(s.duration_nsec);
            }
        }
        MultipartReplyBody::PortDesc(ports) => {
            for p in ports {
                encode_port_desc(buf, p);
            }
        }
        MultipartReplyBody::Flow(flows) => {
            for f in flows {
                let mut entry = BytesMut::new();
                entry.put_u8(f.table_id);
                entry.put_u8(0);
                entry.put_u32(f.duration_sec);
                entry.put_u32(f.duration_nsec);
                entry.put_u16(f.priority);
                entry.put_u16(f.idle_timeout);
                entry.put_u16(f.hard_timeout);
                entry.put_u16(f.flags);
                entry.put_bytes(0, 4);
                entry.put_u64(f.cookie);
                entry.put_u64(f.packet_count);
                entry.put_u64(f.byte_count);
                encode_match(&mut entry, &f.matcher);
                for instruction in &f.instructions {
                    encode_instruction(&mut entry, instruction);
                }
                buf.put_u16((entry.len() + 2) as u16);
                buf.put_slice(&entry);
            }
        }
        MultipartReplyBody::Table(tables) => {
            for t in tables {
                buf.put_u8(t.table_id);
                buf.put_bytes(0, 3);
                buf.put_u32(t.active_count);
                buf.put_u64(t.lookup_count);
                buf.put_u64(t.matched_count);
            }
        }
        MultipartReplyBody::Other { .. } => {}
    }
}

fn decode_multipart_reply(
    multipart_type: u16,
    body: &mut Reader<'_>,
) -> Result<MultipartReplyBody, WireError> {
    let reply = match multipart_type {
        OFPMP_PORT_STATS => {
            let mut stats = Vec::new();
            while body.remaining() >= PORT_STATS_LEN {
                let mut e = body.sub(PORT_STATS_LEN)?;
                let port_no = e.u32()?;
                e.skip(4)?;
                stats.push(PortStats {
                    port_no,
                    rx_packets: e.u64()?,
                    tx_packets: e.u64()?,
                    rx_bytes: e.u64()?,
                    tx_bytes: e.u64()?,
                    rx_dropped: e.u64()?,
                    tx_dropped: e.u64()?,
                    rx_errors: e.u64()?,
                    tx_errors: e.u64()?,
                    rx_frame_err: e.u64()?,
                    rx_over_err: e.u64()?,
                    rx_crc_err: e.u64()?,
                    collisions: e.u64()?,
                    duration_sec: e.u32()?,
                    duration_nsec: e.u32()?,
                });
            }
            MultipartReplyBody::PortStats(stats)
        }
        OFPMP_PORT_DESC => {
            let mut ports = Vec::new();
            while body.remaining() >= PORT_DESC_LEN {
                ports.push(decode_port_desc(body)?);
            }
            MultipartReplyBody::PortDesc(ports)
        }
        OFPMP_FLOW => {
            let mut flows = Vec::new();
            while body.remaining() >= FLOW_STATS_FIXED_LEN {
                let length = body.u16()? as usize;
                if length < FLOW_STATS_FIXED_LEN {
                    return Err(WireError::BadLength {
                        what: "ofp_flow_stats",
                        length,
                    });
                }
                let mut e = body.sub(length - 2)?;
                let table_id = e.u8()?;
                e.skip(1)?;
                let duration_sec = e.u32()?;
                let duration_nsec = e.u32()?;
                let priority = e.u16()?;
                let idle_timeout = e.u16()?;
                let hard_timeout = e.u16()?;
                let flags = e.u16()?;
                e.skip(4)?;
                let cookie = e.u64()?;
                let packet_count = e.u64()?;
                let byte_count = e.u64()?;
                let matcher = decode_match(&mut e)?;
                let instructions = decode_instructions(&mut e)?;
                flows.push(FlowStats {
                    table_id,
                    duration_sec,
                    duration_nsec,
                    priority,
                    idle_timeout,
                    hard_timeout,
                    flags,
                    cookie,
                    packet_count,
                    byte_count,
                    matcher,
                    instructions,
                    length: length as u16,
                });
            }
            MultipartReplyBody::Flow(flows)
        }
        OFPMP_TABLE => {
            let mut tables = Vec::new();
            while body.remaining() >= TABLE_STATS_LEN {
                let mut e = body.sub(TABLE_STATS_LEN)?;
                let table_id = e.u8()?;
                e.skip(3)?;
                tables.push(TableStats {
                    table_id,
                    active_count: e.u32()?,
                    lookup_count: e.u64()?,
                    matched_count: e.u64()?,
                });
            }
            MultipartReplyBody::Table(tables)
        }
        other => MultipartReplyBody::Other {
            multipart_type: other,
        },
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::{FlowRemovedReason, OFPP_CONTROLLER, OFPCML_NO_BUFFER};

    fn tcp_match() -> FlowMatch {
        FlowMatch {
            in_port: Some(5),
            eth_type: Some(0x0800),
            ip_proto: Some(6),
            ipv4_src: Some(Ipv4Addr::new(10, 0, 0, 2)),
            ipv4_dst: Some(Ipv4Addr::new(10, 0, 0, 1)),
            tcp_src: Some(80),
            tcp_dst: Some(51000),
            ..Default::default()
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = Message::Hello.encode(7);
        assert_eq!(&bytes[..], &[0x04, 0, 0, 8, 0, 0, 0, 7]);
        let header: [u8; 8] = bytes[..8].try_into().unwrap();
        assert_eq!(frame_length(&header).unwrap(), 8);
    }

    #[test]
    fn test_frame_length_rejects_other_versions() {
        let header = [0x01, 0, 0, 8, 0, 0, 0, 1];
        assert_eq!(frame_length(&header), Err(WireError::UnsupportedVersion(1)));
        let short = [0x04, 0, 0, 4, 0, 0, 0, 1];
        assert!(matches!(frame_length(&short), Err(WireError::BadLength { .. })));
    }

    #[test]
    fn test_table_miss_flow_mod_bytes() {
        let flow_mod = Message::FlowMod(FlowMod {
            cookie: 0,
            table_id: 1,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: crate::openflow::OFP_NO_BUFFER,
            flags: 0,
            matcher: FlowMatch::any(),
            instructions: vec![Instruction::ApplyActions(vec![Action::Output {
                port: OFPP_CONTROLLER,
                max_len: OFPCML_NO_BUFFER,
            }])],
        });
        let bytes = flow_mod.encode(1);
        // header 8 + fixed 40 + empty match 8 + apply-actions 8 + output 16
        assert_eq!(bytes.len(), 80);
        assert_eq!(bytes[1], OFPT_FLOW_MOD);
        // empty match: type=1, length=4, 4 bytes padding
        assert_eq!(&bytes[48..56], &[0, 1, 0, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_match_padding() {
        let mut buf = BytesMut::new();
        encode_match(&mut buf, &tcp_match());
        assert_eq!(buf.len() % 8, 0);
        // 4 + in_port(8) + eth_type(6) + ip_proto(5) + 2 x ipv4(8) + 2 x tcp(6) = 51
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 51);
        let mut r = Reader::new(&buf);
        assert_eq!(decode_match(&mut r).unwrap(), tcp_match());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_flow_mod_decodes_back() {
        let original = FlowMod {
            cookie: 9,
            table_id: 0,
            idle_timeout: 10,
            hard_timeout: 30,
            priority: 30,
            buffer_id: crate::openflow::OFP_NO_BUFFER,
            flags: crate::openflow::OFPFF_SEND_FLOW_REM,
            matcher: tcp_match(),
            instructions: vec![Instruction::ApplyActions(vec![Action::output(3)])],
        };
        let bytes = Message::FlowMod(original.clone()).encode(42);
        let (xid, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(xid, 42);
        assert_eq!(decoded, Message::FlowMod(original));
    }

    #[test]
    fn test_packet_in_decode() {
        let packet_in = PacketIn {
            buffer_id: crate::openflow::OFP_NO_BUFFER,
            total_len: 4,
            reason: 0,
            table_id: 1,
            cookie: 0,
            matcher: FlowMatch {
                in_port: Some(3),
                ..Default::default()
            },
            data: vec![1, 2, 3, 4],
        };
        let bytes = Message::PacketIn(packet_in.clone()).encode(0);
        let (_, decoded) = Message::decode(&bytes).unwrap();
        match decoded {
            Message::PacketIn(p) => {
                assert_eq!(p.in_port(), Some(3));
                assert_eq!(p.data, vec![1, 2, 3, 4]);
                assert_eq!(p, packet_in);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flow_removed_reason_survives_decode() {
        let removed = FlowRemoved {
            cookie: 0,
            priority: 30,
            reason: FlowRemovedReason::IdleTimeout,
            table_id: 0,
            duration_sec: 12,
            duration_nsec: 0,
            idle_timeout: 10,
            hard_timeout: 0,
            packet_count: 5,
            byte_count: 500,
            matcher: tcp_match(),
        };
        let bytes = Message::FlowRemoved(removed.clone()).encode(0);
        assert_eq!(Message::decode(&bytes).unwrap().1, Message::FlowRemoved(removed));
    }

    #[test]
    fn test_multipart_replies_decode() {
        let port_stats = vec![PortStats {
            port_no: 1,
            rx_packets: 10,
            tx_bytes: 999,
            duration_sec: 4,
            ..Default::default()
        }];
        let bytes = Message::MultipartReply {
            flags: 0,
            body: MultipartReplyBody::PortStats(port_stats.clone()),
        }
        .encode(3);
        assert_eq!(bytes.len(), 8 + 8 + PORT_STATS_LEN);
        assert_eq!(
            Message::decode(&bytes).unwrap().1,
            Message::MultipartReply {
                flags: 0,
                body: MultipartReplyBody::PortStats(port_stats)
            }
        );

        let flows = vec![FlowStats {
            table_id: 0,
            priority: 25,
            packet_count: 7,
            matcher: tcp_match(),
            instructions: vec![Instruction::ApplyActions(vec![Action::output(2)])],
            ..Default::default()
        }];
        let bytes = Message::MultipartReply {
            flags: crate::openflow::OFPMPF_REPLY_MORE,
            body: MultipartReplyBody::Flow(flows),
        }
        .encode(4);
        match Message::decode(&bytes).unwrap().1 {
            Message::MultipartReply {
                flags,
                body: MultipartReplyBody::Flow(decoded),
            } => {
                assert_eq!(flags, crate::openflow::OFPMPF_REPLY_MORE);
                assert_eq!(decoded.len(), 1);
                assert_eq!(decoded[0].matcher, tcp_match());
                assert_eq!(decoded[0].packet_count, 7);
                assert_eq!(decoded[0].length as usize, bytes.len() - 16);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_port_status_name_trimmed() {
        let status = PortStatus {
            reason: crate::openflow::PortReason::Add,
            desc: PortDesc {
                port_no: 2,
                hw_addr: MacAddr([0, 0, 0, 0, 0, 2]),
                name: "s1-eth2".to_string(),
                curr_speed: 10_000_000,
                ..Default::default()
            },
        };
        let bytes = Message::PortStatus(status.clone()).encode(0);
        assert_eq!(bytes.len(), 8 + 8 + PORT_DESC_LEN);
        assert_eq!(Message::decode(&bytes).unwrap().1, Message::PortStatus(status));
    }

    #[test]
    fn test_truncated_body_is_error() {
        let mut bytes = Message::FeaturesReply(SwitchFeatures {
            datapath_id: 1,
            n_buffers: 0,
            n_tables: 2,
            auxiliary_id: 0,
            capabilities: 0,
        })
        .encode(0)
        .to_vec();
        bytes.truncate(12);
        bytes[3] = 12;
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }
}
