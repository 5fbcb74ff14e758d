//! Reply handlers: statistics replies and asynchronous switch notifications
//! become telemetry records.
//!
//! Every entry in a reply becomes one record stamped with the capture time of
//! the reply. Replies from switches the registry no longer knows are
//! discarded.

use crate::openflow::{FlowRemoved, FlowStats, PortDesc, PortStats, PortStatus, TableStats};
use crate::registry::DatapathRegistry;
use crate::telemetry::{
    EventDetails, FlowRemovedSummary, FlowStatsRecord, PortDescRecord, PortStatsRecord,
    PortStatusSummary, TableStatsRecord, TelemetryRecord, TelemetrySink,
};
use crate::types::{now_ms, DatapathId};
use log::{debug, info};
use std::sync::Arc;

pub struct ReplyHandlers {
    registry: Arc<DatapathRegistry>,
    sink: Arc<dyn TelemetrySink>,
}

impl ReplyHandlers {
    pub fn new(registry: Arc<DatapathRegistry>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { registry, sink }
    }

    fn accepts(&self, id: DatapathId, what: &str) -> bool {
        let known = self.registry.is_connected(id);
        if !known {
            debug!("Discarding {} from unregistered switch {}", what, id);
        }
        known
    }

    /// Returns the number of records emitted.
    pub fn on_port_stats(&self, id: DatapathId, stats: &[PortStats]) -> usize {
        if !self.accepts(id, "port stats reply") {
            return 0;
        }
        let ts = now_ms();
        for entry in stats {
            self.sink
                .record(TelemetryRecord::PortStats(PortStatsRecord::new(id, ts, entry)));
        }
        stats.len()
    }

    pub fn on_port_desc(&self, id: DatapathId, ports: &[PortDesc]) -> usize {
        if !self.accepts(id, "port description reply") {
            return 0;
        }
        let ts = now_ms();
        for port in ports {
            self.sink
                .record(TelemetryRecord::PortDesc(PortDescRecord::new(id, ts, port)));
        }
        ports.len()
    }

    pub fn on_flow_stats(&self, id: DatapathId, flows: &[FlowStats]) -> usize {
        if !self.accepts(id, "flow stats reply") {
            return 0;
        }
        let ts = now_ms();
        for flow in flows {
            self.sink
                .record(TelemetryRecord::FlowStats(FlowStatsRecord::new(id, ts, flow)));
        }
        flows.len()
    }

    /// Idle tables (no entries, no lookups, no matches) are not recorded.
    pub fn on_table_stats(&self, id: DatapathId, tables: &[TableStats]) -> usize {
        if !self.accepts(id, "table stats reply") {
            return 0;
        }
        let ts = now_ms();
        let mut emitted = 0;
        for table in tables.iter().filter(|t| t.has_activity()) {
            self.sink
                .record(TelemetryRecord::TableStats(TableStatsRecord::new(id, ts, table)));
            emitted += 1;
        }
        emitted
    }

    /// One event per removal, whatever the poll timing.
    pub fn on_flow_removed(&self, id: DatapathId, removed: &FlowRemoved) -> bool {
        if !self.accepts(id, "flow removed") {
            return false;
        }
        debug!(
            "Switch {}: flow removed from table {} ({:?}): {}",
            id, removed.table_id, removed.reason, removed.matcher
        );
        self.sink.event(
            id,
            now_ms(),
            EventDetails::FlowRemoved(FlowRemovedSummary::from(removed)),
        );
        true
    }

    pub fn on_port_status(&self, id: DatapathId, status: &PortStatus) -> bool {
        if !self.accepts(id, "port status") {
            return false;
        }
        info!(
            "Switch {}: port {} ({}) {:?}",
            id, status.desc.port_no, status.desc.name, status.reason
        );
        self.sink.event(
            id,
            now_ms(),
            EventDetails::PortStatus(PortStatusSummary::from(status)),
        );
        true
    }
}
