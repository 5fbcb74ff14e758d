//! Inbound events delivered by the transport.

use crate::command::SwitchHandle;
use crate::openflow::{FlowRemoved, FlowStats, PortDesc, PortStats, PortStatus, TableStats};
use crate::types::{ConnectionId, DatapathId, PortNo};
use std::fmt;
use std::sync::Arc;

/// Everything a switch connection can tell the controller.
pub enum ControllerEvent {
    SwitchConnected {
        id: DatapathId,
        connection: ConnectionId,
        handle: Arc<dyn SwitchHandle>,
    },
    /// Ends `connection` only; a newer connection of the same switch survives.
    SwitchDisconnected {
        id: DatapathId,
        connection: ConnectionId,
    },
    PacketIn {
        id: DatapathId,
        in_port: PortNo,
        data: Vec<u8>,
        /// Switch buffer token, `None` when the switch sent the full packet.
        buffer_id: Option<u32>,
    },
    PortStatsReply {
        id: DatapathId,
        stats: Vec<PortStats>,
    },
    PortDescReply {
        id: DatapathId,
        ports: Vec<PortDesc>,
    },
    FlowStatsReply {
        id: DatapathId,
        flows: Vec<FlowStats>,
    },
    TableStatsReply {
        id: DatapathId,
        tables: Vec<TableStats>,
    },
    FlowRemoved {
        id: DatapathId,
        removed: FlowRemoved,
    },
    PortStatus {
        id: DatapathId,
        status: PortStatus,
    },
    /// OFPT_ERROR from the switch.
    SwitchError {
        id: DatapathId,
        error_type: u16,
        code: u16,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SwitchConnected,
    SwitchDisconnected,
    PacketIn,
    PortStatsReply,
    PortDescReply,
    FlowStatsReply,
    TableStatsReply,
    FlowRemoved,
    PortStatus,
    SwitchError,
}

impl ControllerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ControllerEvent::SwitchConnected { .. } => EventKind::SwitchConnected,
            ControllerEvent::SwitchDisconnected { .. } => EventKind::SwitchDisconnected,
            ControllerEvent::PacketIn { .. } => EventKind::PacketIn,
            ControllerEvent::PortStatsReply { .. } => EventKind::PortStatsReply,
            ControllerEvent::PortDescReply { .. } => EventKind::PortDescReply,
            ControllerEvent::FlowStatsReply { .. } => EventKind::FlowStatsReply,
            ControllerEvent::TableStatsReply { .. } => EventKind::TableStatsReply,
            ControllerEvent::FlowRemoved { .. } => EventKind::FlowRemoved,
            ControllerEvent::PortStatus { .. } => EventKind::PortStatus,
            ControllerEvent::SwitchError { .. } => EventKind::SwitchError,
        }
    }

    /// Datapath the event belongs to.
    pub fn datapath_id(&self) -> DatapathId {
        match self {
            ControllerEvent::SwitchConnected { id, .. }
            | ControllerEvent::SwitchDisconnected { id, .. }
            | ControllerEvent::PacketIn { id, .. }
            | ControllerEvent::PortStatsReply { id, .. }
            | ControllerEvent::PortDescReply { id, .. }
            | ControllerEvent::FlowStatsReply { id, .. }
            | ControllerEvent::TableStatsReply { id, .. }
            | ControllerEvent::FlowRemoved { id, .. }
            | ControllerEvent::PortStatus { id, .. }
            | ControllerEvent::SwitchError { id, .. } => *id,
        }
    }
}

impl fmt::Debug for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(dpid={})", self.kind(), self.datapath_id())
    }
}
