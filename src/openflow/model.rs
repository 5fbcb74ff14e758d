//! OpenFlow 1.3 protocol structures.
//!
//! These are the semantic shapes of the messages; byte layout lives in `codec`.

use crate::types::{DatapathId, MacAddr, PortNo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

// ================================================================================================
// MATCH
// ================================================================================================

/// OXM match with the fields the controller installs and reports.
///
/// Absent fields are wildcards. Fields are emitted on the wire in declaration
/// order, which satisfies the OpenFlow prerequisite chain
/// (eth_type before ip_proto before transport ports).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<PortNo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_dst: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_type: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_proto: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_src: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_dst: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_src: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_dst: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_src: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_dst: Option<u16>,
}

impl FlowMatch {
    /// Match everything (table-miss and pipeline defaults).
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(v) = self.in_port {
            parts.push(format!("in_port={}", v));
        }
        if let Some(v) = self.eth_dst {
            parts.push(format!("eth_dst={}", v));
        }
        if let Some(v) = self.eth_src {
            parts.push(format!("eth_src={}", v));
        }
        if let Some(v) = self.eth_type {
            parts.push(format!("eth_type=0x{:04x}", v));
        }
        if let Some(v) = self.ip_proto {
            parts.push(format!("ip_proto={}", v));
        }
        if let Some(v) = self.ipv4_src {
            parts.push(format!("ipv4_src={}", v));
        }
        if let Some(v) = self.ipv4_dst {
            parts.push(format!("ipv4_dst={}", v));
        }
        if let Some(v) = self.tcp_src {
            parts.push(format!("tcp_src={}", v));
        }
        if let Some(v) = self.tcp_dst {
            parts.push(format!("tcp_dst={}", v));
        }
        if let Some(v) = self.udp_src {
            parts.push(format!("udp_src={}", v));
        }
        if let Some(v) = self.udp_dst {
            parts.push(format!("udp_dst={}", v));
        }
        if parts.is_empty() {
            write!(f, "any")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

// ================================================================================================
// ACTIONS & INSTRUCTIONS
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Output { port: PortNo, max_len: u16 },
    /// Any action type the controller does not interpret.
    Other { action_type: u16 },
}

impl Action {
    pub fn output(port: PortNo) -> Self {
        Action::Output { port, max_len: 0 }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Output { port, .. } => match *port {
                super::OFPP_FLOOD => write!(f, "output:flood"),
                super::OFPP_CONTROLLER => write!(f, "output:controller"),
                p => write!(f, "output:{}", p),
            },
            Action::Other { action_type } => write!(f, "action_type:{}", action_type),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    GotoTable(u8),
    ApplyActions(Vec<Action>),
    Other { instruction_type: u16 },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::GotoTable(table) => write!(f, "goto_table:{}", table),
            Instruction::ApplyActions(actions) => {
                let rendered: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
                write!(f, "apply_actions[{}]", rendered.join(","))
            }
            Instruction::Other { instruction_type } => {
                write!(f, "instruction_type:{}", instruction_type)
            }
        }
    }
}

/// Renders an instruction list the way the flow-stats stream stores it.
pub fn render_instructions(instructions: &[Instruction]) -> String {
    let rendered: Vec<String> = instructions.iter().map(|i| i.to_string()).collect();
    rendered.join(";")
}

// ================================================================================================
// SWITCH → CONTROLLER MESSAGES
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: DatapathId,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub capabilities: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub reason: u8,
    pub table_id: u8,
    pub cookie: u64,
    pub matcher: FlowMatch,
    pub data: Vec<u8>,
}

impl PacketIn {
    /// Ingress port reported in the packet-in match.
    pub fn in_port(&self) -> Option<PortNo> {
        self.matcher.in_port
    }
}

/// Why a flow entry left the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    GroupDelete,
    Unknown(u8),
}

impl From<u8> for FlowRemovedReason {
    fn from(value: u8) -> Self {
        match value {
            0 => FlowRemovedReason::IdleTimeout,
            1 => FlowRemovedReason::HardTimeout,
            2 => FlowRemovedReason::Delete,
            3 => FlowRemovedReason::GroupDelete,
            other => FlowRemovedReason::Unknown(other),
        }
    }
}

impl From<FlowRemovedReason> for u8 {
    fn from(value: FlowRemovedReason) -> Self {
        match value {
            FlowRemovedReason::IdleTimeout => 0,
            FlowRemovedReason::HardTimeout => 1,
            FlowRemovedReason::Delete => 2,
            FlowRemovedReason::GroupDelete => 3,
            FlowRemovedReason::Unknown(other) => other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowRemoved {
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
    pub matcher: FlowMatch,
}

/// Why a port's descriptor changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReason {
    Add,
    Delete,
    Modify,
    Unknown(u8),
}

impl From<u8> for PortReason {
    fn from(value: u8) -> Self {
        match value {
            0 => PortReason::Add,
            1 => PortReason::Delete,
            2 => PortReason::Modify,
            other => PortReason::Unknown(other),
        }
    }
}

impl From<PortReason> for u8 {
    fn from(value: PortReason) -> Self {
        match value {
            PortReason::Add => 0,
            PortReason::Delete => 1,
            PortReason::Modify => 2,
            PortReason::Unknown(other) => other,
        }
    }
}

/// `ofp_port`: capability, speed and administrative state of one port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
    pub curr_speed: u32,
    pub max_speed: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

// ================================================================================================
// MULTIPART STATISTICS
// ================================================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    pub port_no: PortNo,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_frame_err: u64,
    pub rx_over_err: u64,
    pub rx_crc_err: u64,
    pub collisions: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub matcher: FlowMatch,
    pub instructions: Vec<Instruction>,
    /// Entry length as reported on the wire.
    pub length: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub table_id: u8,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

impl TableStats {
    /// True when the table holds entries or has seen any lookups.
    pub fn has_activity(&self) -> bool {
        self.active_count > 0 || self.lookup_count > 0 || self.matched_count > 0
    }
}

// ================================================================================================
// CONTROLLER → SWITCH
// ================================================================================================

/// FLOW_MOD with command ADD; the controller never modifies or deletes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowMod {
    pub cookie: u64,
    pub table_id: u8,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub flags: u16,
    pub matcher: FlowMatch,
    pub instructions: Vec<Instruction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_display_orders_fields() {
        let m = FlowMatch {
            in_port: Some(5),
            eth_type: Some(0x0800),
            ip_proto: Some(6),
            ipv4_src: Some(Ipv4Addr::new(10, 0, 0, 2)),
            ipv4_dst: Some(Ipv4Addr::new(10, 0, 0, 1)),
            tcp_src: Some(80),
            tcp_dst: Some(51000),
            ..Default::default()
        };
        assert_eq!(
            m.to_string(),
            "in_port=5,eth_type=0x0800,ip_proto=6,ipv4_src=10.0.0.2,ipv4_dst=10.0.0.1,tcp_src=80,tcp_dst=51000"
        );
        assert_eq!(FlowMatch::any().to_string(), "any");
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(FlowRemovedReason::from(0), FlowRemovedReason::IdleTimeout);
        assert_eq!(FlowRemovedReason::from(3), FlowRemovedReason::GroupDelete);
        assert_eq!(u8::from(FlowRemovedReason::Unknown(9)), 9);
        assert_eq!(PortReason::from(2), PortReason::Modify);
    }

    #[test]
    fn test_table_activity() {
        assert!(!TableStats::default().has_activity());
        let busy = TableStats {
            lookup_count: 1,
            ..Default::default()
        };
        assert!(busy.has_activity());
    }

    #[test]
    fn test_instruction_rendering() {
        let rendered = render_instructions(&[
            Instruction::GotoTable(1),
            Instruction::ApplyActions(vec![Action::output(crate::openflow::OFPP_FLOOD)]),
        ]);
        assert_eq!(rendered, "goto_table:1;apply_actions[output:flood]");
    }
}
