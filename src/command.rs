//! Outbound command vocabulary and the send seam to a switch.
//!
//! The core decides *what* to send (`SwitchCommand`); a `SwitchHandle`
//! owned by the transport decides *how*. Sends are fire-and-forget: a handle
//! never waits for the switch, and a failed send is only ever logged.

use crate::openflow::{
    Action, FlowMatch, FlowMod, Instruction, Message, MultipartRequest, OFPCML_NO_BUFFER,
    OFPFF_SEND_FLOW_REM, OFPP_CONTROLLER, OFPP_FLOOD, OFP_NO_BUFFER,
};
use crate::types::PortNo;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tables of the two-stage pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStage {
    /// Stage 0: learned forwarding rules, plus a default that continues to stage 1.
    Learned,
    /// Stage 1: the table-miss rule that escalates to the controller.
    Miss,
}

impl TableStage {
    pub fn table_id(self) -> u8 {
        match self {
            TableStage::Learned => 0,
            TableStage::Miss => 1,
        }
    }
}

/// Where a forwarded packet goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
    Port(PortNo),
    /// Every port except the ingress port (reserved `OFPP_FLOOD`).
    Flood,
}

impl OutputAction {
    pub fn port_no(self) -> PortNo {
        match self {
            OutputAction::Port(p) => p,
            OutputAction::Flood => OFPP_FLOOD,
        }
    }

    pub fn is_flood(self) -> bool {
        matches!(self, OutputAction::Flood)
    }

    fn to_action(self) -> Action {
        Action::output(self.port_no())
    }
}

impl fmt::Display for OutputAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputAction::Port(p) => write!(f, "{}", p),
            OutputAction::Flood => write!(f, "flood"),
        }
    }
}

/// What an installed rule does with matching packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Output(OutputAction),
    /// Send the whole packet to the controller without buffering.
    ToController,
    /// Continue lookup in another stage.
    GotoStage(TableStage),
}

impl RuleAction {
    fn to_instruction(self) -> Instruction {
        match self {
            RuleAction::Output(out) => Instruction::ApplyActions(vec![out.to_action()]),
            RuleAction::ToController => Instruction::ApplyActions(vec![Action::Output {
                port: OFPP_CONTROLLER,
                max_len: OFPCML_NO_BUFFER,
            }]),
            RuleAction::GotoStage(stage) => Instruction::GotoTable(stage.table_id()),
        }
    }
}

/// A forwarding rule to install: match + action + priority + timeouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowRuleIntent {
    pub stage: TableStage,
    pub priority: u16,
    pub matcher: FlowMatch,
    pub action: RuleAction,
    /// Seconds; 0 never expires.
    pub idle_timeout: u16,
    /// Seconds; 0 never expires.
    pub hard_timeout: u16,
    /// Ask the switch for FLOW_REMOVED when the rule leaves the table.
    pub notify_removal: bool,
}

impl FlowRuleIntent {
    pub fn to_flow_mod(&self) -> FlowMod {
        FlowMod {
            cookie: 0,
            table_id: self.stage.table_id(),
            idle_timeout: self.idle_timeout,
            hard_timeout: self.hard_timeout,
            priority: self.priority,
            buffer_id: OFP_NO_BUFFER,
            flags: if self.notify_removal {
                OFPFF_SEND_FLOW_REM
            } else {
                0
            },
            matcher: self.matcher.clone(),
            instructions: vec![self.action.to_instruction()],
        }
    }
}

/// Packet bytes for a PACKET_OUT: a switch buffer token or the raw frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketPayload {
    Buffered(u32),
    Raw(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketOut {
    pub payload: PacketPayload,
    pub in_port: PortNo,
    pub action: OutputAction,
}

/// Everything the core ever asks a switch to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchCommand {
    InstallRule(FlowRuleIntent),
    PacketOut(PacketOut),
    RequestPortStats,
    RequestPortDesc,
    RequestFlowStats,
    RequestTableStats,
}

impl SwitchCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SwitchCommand::InstallRule(_) => "install_rule",
            SwitchCommand::PacketOut(_) => "packet_out",
            SwitchCommand::RequestPortStats => "request_port_stats",
            SwitchCommand::RequestPortDesc => "request_port_desc",
            SwitchCommand::RequestFlowStats => "request_flow_stats",
            SwitchCommand::RequestTableStats => "request_table_stats",
        }
    }

    pub fn is_stats_request(&self) -> bool {
        matches!(
            self,
            SwitchCommand::RequestPortStats
                | SwitchCommand::RequestPortDesc
                | SwitchCommand::RequestFlowStats
                | SwitchCommand::RequestTableStats
        )
    }

    /// Wire message for this command.
    pub fn to_message(&self) -> Message {
        match self {
            SwitchCommand::InstallRule(intent) => Message::FlowMod(intent.to_flow_mod()),
            SwitchCommand::PacketOut(out) => {
                let (buffer_id, data) = match &out.payload {
                    PacketPayload::Buffered(id) => (*id, Vec::new()),
                    PacketPayload::Raw(bytes) => (OFP_NO_BUFFER, bytes.clone()),
                };
                Message::PacketOut {
                    buffer_id,
                    in_port: out.in_port,
                    actions: vec![out.action.to_action()],
                    data,
                }
            }
            SwitchCommand::RequestPortStats => {
                Message::MultipartRequest(MultipartRequest::all_ports())
            }
            SwitchCommand::RequestPortDesc => Message::MultipartRequest(MultipartRequest::PortDesc),
            SwitchCommand::RequestFlowStats => {
                Message::MultipartRequest(MultipartRequest::all_flows())
            }
            SwitchCommand::RequestTableStats => Message::MultipartRequest(MultipartRequest::Table),
        }
    }
}

/// Send-capable reference to one connected switch.
///
/// `send` must not block. An `Err` means the command was dropped (closed
/// connection, full queue); callers log it and move on.
pub trait SwitchHandle: Send + Sync {
    fn send(&self, command: SwitchCommand) -> Result<(), String>;
}
