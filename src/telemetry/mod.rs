//! # Telemetry Module
//!
//! Everything the controller learns about its switches ends up here:
//! - Counter snapshots (ports, flows, tables) from the poller's replies
//! - Port descriptors, at connect time and on demand
//! - Discrete events (packet-in decisions, rule removals, port changes,
//!   switch lifecycle and diagnostics)
//!
//! Producers only see the `TelemetrySink` trait; the recorder persists to
//! per-kind JSON-lines streams and `query` reads them back.

pub mod query;
pub mod record;
pub mod recorder;
pub mod writer;

pub use query::{QueryFilter, QueryResult, TelemetryQuery, TelemetryStatistics};
pub use record::{
    EventDetails, EventRecord, EventType, FlowRemovedSummary, FlowStatsRecord, PacketInSummary,
    PortDescRecord, PortStatsRecord, PortStatusSummary, RecordKind, TableStatsRecord,
    TelemetryRecord,
};
pub use recorder::{MemorySink, TelemetryConfig, TelemetryRecorder, TelemetrySink, TelemetryStats};
pub use writer::{RotationPolicy, StreamStats, TelemetryWriter, WriterConfig};
