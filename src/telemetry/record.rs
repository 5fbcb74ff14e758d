//! # Telemetry Records
//!
//! One timestamped, per-switch unit of collected data. Records are built by
//! the flow manager and the reply handlers, handed to a sink, and never
//! mutated afterwards.
//!
//! Serialized as one JSON object per line with a `kind` tag, so every stream
//! can be read back without knowing which file it came from.

use crate::command::OutputAction;
use crate::flow::classify::Classification;
use crate::openflow::{
    render_instructions, FlowMatch, FlowRemoved, FlowRemovedReason, FlowStats, PortDesc,
    PortReason, PortStats, PortStatus, TableStats,
};
use crate::types::{DatapathId, MacAddr, PortNo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ================================================================================================
// RECORD KINDS
// ================================================================================================

/// The five record kinds; each one persists to its own stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    PortStats,
    PortDesc,
    FlowStats,
    TableStats,
    Event,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::PortStats,
        RecordKind::PortDesc,
        RecordKind::FlowStats,
        RecordKind::TableStats,
        RecordKind::Event,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::PortStats => "port_stats",
            RecordKind::PortDesc => "port_desc",
            RecordKind::FlowStats => "flow_stats",
            RecordKind::TableStats => "table_stats",
            RecordKind::Event => "event",
        }
    }

    /// Base file name of the stream for this kind.
    pub fn stream_name(self) -> &'static str {
        match self {
            RecordKind::PortStats => "port_stats.jsonl",
            RecordKind::PortDesc => "port_desc.jsonl",
            RecordKind::FlowStats => "flow_stats.jsonl",
            RecordKind::TableStats => "table_stats.jsonl",
            RecordKind::Event => "events.jsonl",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "port_stats" => Ok(RecordKind::PortStats),
            "port_desc" => Ok(RecordKind::PortDesc),
            "flow_stats" => Ok(RecordKind::FlowStats),
            "table_stats" => Ok(RecordKind::TableStats),
            "event" | "events" => Ok(RecordKind::Event),
            other => Err(format!(
                "unknown record kind '{}' (expected port_stats, port_desc, flow_stats, table_stats or event)",
                other
            )),
        }
    }
}

// ================================================================================================
// COUNTER SNAPSHOTS
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatsRecord {
    pub ts_ms: u64,
    pub switch_dpid: DatapathId,
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

impl PortStatsRecord {
    pub fn new(switch_dpid: DatapathId, ts_ms: u64, stats: &PortStats) -> Self {
        PortStatsRecord {
            ts_ms,
            switch_dpid,
            port_no: stats.port_no,
            rx_packets: stats.rx_packets,
            tx_packets: stats.tx_packets,
            rx_bytes: stats.rx_bytes,
            tx_bytes: stats.tx_bytes,
            rx_dropped: stats.rx_dropped,
            tx_dropped: stats.tx_dropped,
            rx_errors: stats.rx_errors,
            tx_errors: stats.tx_errors,
            rx_frame_err: stats.rx_frame_err,
            rx_over_err: stats.rx_over_err,
            rx_crc_err: stats.rx_crc_err,
            collisions: stats.collisions,
            duration_sec: stats.duration_sec,
            duration_nsec: stats.duration_nsec,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescRecord {
    pub ts_ms: u64,
    pub switch_dpid: DatapathId,
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

impl PortDescRecord {
    pub fn new(switch_dpid: DatapathId, ts_ms: u64, desc: &PortDesc) -> Self {
        PortDescRecord {
            ts_ms,
            switch_dpid,
            port_no: desc.port_no,
            hw_addr: desc.hw_addr,
            name: desc.name.clone(),
            config: desc.config,
            state: desc.state,
            curr: desc.curr,
            advertised: desc.advertised,
            supported: desc.supported,
            peer: desc.peer,
            curr_speed: desc.curr_speed,
            max_speed: desc.max_speed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatsRecord {
    pub ts_ms: u64,
    pub switch_dpid: DatapathId,
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub flags: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub priority: u16,
    #[serde(rename = "match")]
    pub matcher: FlowMatch,
    pub instructions: String,
    pub length: u16,
}

impl FlowStatsRecord {
    pub fn new(switch_dpid: DatapathId, ts_ms: u64, flow: &FlowStats) -> Self {
        FlowStatsRecord {
            ts_ms,
            switch_dpid,
            table_id: flow.table_id,
            duration_sec: flow.duration_sec,
            duration_nsec: flow.duration_nsec,
            idle_timeout: flow.idle_timeout,
            hard_timeout: flow.hard_timeout,
            flags: flow.flags,
            cookie: flow.cookie,
            packet_count: flow.packet_count,
            byte_count: flow.byte_count,
            priority: flow.priority,
            matcher: flow.matcher.clone(),
            instructions: render_instructions(&flow.instructions),
            length: flow.length,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatsRecord {
    pub ts_ms: u64,
    pub switch_dpid: DatapathId,
    pub table_id: u8,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

impl TableStatsRecord {
    pub fn new(switch_dpid: DatapathId, ts_ms: u64, table: &TableStats) -> Self {
        TableStatsRecord {
            ts_ms,
            switch_dpid,
            table_id: table.table_id,
            active_count: table.active_count,
            lookup_count: table.lookup_count,
            matched_count: table.matched_count,
        }
    }
}

// ================================================================================================
// DISCRETE EVENTS
// ================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PacketIn,
    FlowRemoved,
    PortStatus,
    SwitchConnected,
    SwitchDisconnected,
    ParseError,
    SwitchError,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PacketIn => "packet_in",
            EventType::FlowRemoved => "flow_removed",
            EventType::PortStatus => "port_status",
            EventType::SwitchConnected => "switch_connected",
            EventType::SwitchDisconnected => "switch_disconnected",
            EventType::ParseError => "parse_error",
            EventType::SwitchError => "switch_error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "packet_in" => Ok(EventType::PacketIn),
            "flow_removed" => Ok(EventType::FlowRemoved),
            "port_status" => Ok(EventType::PortStatus),
            "switch_connected" => Ok(EventType::SwitchConnected),
            "switch_disconnected" => Ok(EventType::SwitchDisconnected),
            "parse_error" => Ok(EventType::ParseError),
            "switch_error" => Ok(EventType::SwitchError),
            other => Err(format!("unknown event type '{}'", other)),
        }
    }
}

/// Summary of one packet-in decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketInSummary {
    pub in_port: PortNo,
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub eth_type: u16,
    pub classification: Classification,
    pub priority: u16,
    pub output: OutputAction,
    /// False when the destination was unknown and the packet was flooded.
    pub rule_installed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRemovedSummary {
    pub cookie: u64,
    pub table_id: u8,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    #[serde(rename = "match")]
    pub matcher: FlowMatch,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl From<&FlowRemoved> for FlowRemovedSummary {
    fn from(removed: &FlowRemoved) -> Self {
        FlowRemovedSummary {
            cookie: removed.cookie,
            table_id: removed.table_id,
            priority: removed.priority,
            reason: removed.reason,
            matcher: removed.matcher.clone(),
            duration_sec: removed.duration_sec,
            duration_nsec: removed.duration_nsec,
            idle_timeout: removed.idle_timeout,
            hard_timeout: removed.hard_timeout,
            packet_count: removed.packet_count,
            byte_count: removed.byte_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatusSummary {
    pub reason: PortReason,
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr_speed: u32,
    pub max_speed: u32,
}

impl From<&PortStatus> for PortStatusSummary {
    fn from(status: &PortStatus) -> Self {
        PortStatusSummary {
            reason: status.reason,
            port_no: status.desc.port_no,
            hw_addr: status.desc.hw_addr,
            name: status.desc.name.clone(),
            config: status.desc.config,
            state: status.desc.state,
            curr_speed: status.desc.curr_speed,
            max_speed: status.desc.max_speed,
        }
    }
}

/// Structured body of an event record, one variant per event type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDetails {
    PacketIn(PacketInSummary),
    FlowRemoved(FlowRemovedSummary),
    PortStatus(PortStatusSummary),
    SwitchConnected,
    SwitchDisconnected,
    ParseError {
        in_port: PortNo,
        length: usize,
        reason: String,
    },
    SwitchError {
        error_type: u16,
        code: u16,
    },
}

impl EventDetails {
    pub fn event_type(&self) -> EventType {
        match self {
            EventDetails::PacketIn(_) => EventType::PacketIn,
            EventDetails::FlowRemoved(_) => EventType::FlowRemoved,
            EventDetails::PortStatus(_) => EventType::PortStatus,
            EventDetails::SwitchConnected => EventType::SwitchConnected,
            EventDetails::SwitchDisconnected => EventType::SwitchDisconnected,
            EventDetails::ParseError { .. } => EventType::ParseError,
            EventDetails::SwitchError { .. } => EventType::SwitchError,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts_ms: u64,
    pub switch_dpid: DatapathId,
    pub event_type: EventType,
    pub details: EventDetails,
}

impl EventRecord {
    pub fn new(switch_dpid: DatapathId, ts_ms: u64, details: EventDetails) -> Self {
        EventRecord {
            ts_ms,
            switch_dpid,
            event_type: details.event_type(),
            details,
        }
    }
}

// ================================================================================================
// RECORD
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    PortStats(PortStatsRecord),
    PortDesc(PortDescRecord),
    FlowStats(FlowStatsRecord),
    TableStats(TableStatsRecord),
    Event(EventRecord),
}

impl TelemetryRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            TelemetryRecord::PortStats(_) => RecordKind::PortStats,
            TelemetryRecord::PortDesc(_) => RecordKind::PortDesc,
            TelemetryRecord::FlowStats(_) => RecordKind::FlowStats,
            TelemetryRecord::TableStats(_) => RecordKind::TableStats,
            TelemetryRecord::Event(_) => RecordKind::Event,
        }
    }

    pub fn switch_dpid(&self) -> DatapathId {
        match self {
            TelemetryRecord::PortStats(r) => r.switch_dpid,
            TelemetryRecord::PortDesc(r) => r.switch_dpid,
            TelemetryRecord::FlowStats(r) => r.switch_dpid,
            TelemetryRecord::TableStats(r) => r.switch_dpid,
            TelemetryRecord::Event(r) => r.switch_dpid,
        }
    }

    pub fn ts_ms(&self) -> u64 {
        match self {
            TelemetryRecord::PortStats(r) => r.ts_ms,
            TelemetryRecord::PortDesc(r) => r.ts_ms,
            TelemetryRecord::FlowStats(r) => r.ts_ms,
            TelemetryRecord::TableStats(r) => r.ts_ms,
            TelemetryRecord::Event(r) => r.ts_ms,
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        match self {
            TelemetryRecord::Event(r) => Some(r.event_type),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventRecord> {
        match self {
            TelemetryRecord::Event(r) => Some(r),
            _ => None,
        }
    }
}
