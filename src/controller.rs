//! Event router.
//!
//! Every inbound event goes through `Controller::dispatch`, which matches on
//! the event kind and calls the one component responsible for it. The
//! transport calls it from each connection's task, so events of one switch
//! arrive in order while different switches run concurrently.

use crate::event::ControllerEvent;
use crate::flow::{FlowConfig, FlowManager};
use crate::poller::{PollService, ReplyHandlers};
use crate::registry::DatapathRegistry;
use crate::telemetry::{EventDetails, TelemetrySink};
use crate::types::now_ms;
use log::{debug, info, trace, warn};
use std::sync::Arc;

pub struct Controller {
    registry: Arc<DatapathRegistry>,
    flows: FlowManager,
    replies: ReplyHandlers,
    polls: PollService,
    sink: Arc<dyn TelemetrySink>,
}

impl Controller {
    pub fn new(
        registry: Arc<DatapathRegistry>,
        sink: Arc<dyn TelemetrySink>,
        flow_config: FlowConfig,
    ) -> Self {
        Controller {
            flows: FlowManager::new(Arc::clone(&registry), Arc::clone(&sink), flow_config),
            replies: ReplyHandlers::new(Arc::clone(&registry), Arc::clone(&sink)),
            polls: PollService::new(Arc::clone(&registry)),
            registry,
            sink,
        }
    }

    pub fn dispatch(&self, event: ControllerEvent) {
        trace!("Dispatching {:?}", event);

        match event {
            ControllerEvent::SwitchConnected {
                id,
                connection,
                handle,
            } => {
                self.registry.register_connection(id, connection, handle);
                info!("Switch {} connected ({})", id, connection);
                self.flows.on_switch_connected(id);
                self.polls.request_port_desc(id);
                self.sink.event(id, now_ms(), EventDetails::SwitchConnected);
            }
            ControllerEvent::SwitchDisconnected { id, connection } => {
                if self.registry.unregister(id, connection) {
                    info!("Switch {} disconnected ({})", id, connection);
                    self.flows.on_switch_disconnected(id);
                    self.sink
                        .event(id, now_ms(), EventDetails::SwitchDisconnected);
                } else {
                    debug!(
                        "Ignoring disconnect of switch {} for superseded {}",
                        id, connection
                    );
                }
            }
            ControllerEvent::PacketIn {
                id,
                in_port,
                data,
                buffer_id,
            } => {
                self.flows.on_packet_in(id, in_port, &data, buffer_id);
            }
            ControllerEvent::PortStatsReply { id, stats } => {
                self.replies.on_port_stats(id, &stats);
            }
            ControllerEvent::PortDescReply { id, ports } => {
                self.replies.on_port_desc(id, &ports);
            }
            ControllerEvent::FlowStatsReply { id, flows } => {
                self.replies.on_flow_stats(id, &flows);
            }
            ControllerEvent::TableStatsReply { id, tables } => {
                self.replies.on_table_stats(id, &tables);
            }
            ControllerEvent::FlowRemoved { id, removed } => {
                self.replies.on_flow_removed(id, &removed);
            }
            ControllerEvent::PortStatus { id, status } => {
                self.replies.on_port_status(id, &status);
            }
            ControllerEvent::SwitchError {
                id,
                error_type,
                code,
            } => {
                warn!(
                    "Switch {} reported error type {} code {}",
                    id, error_type, code
                );
                self.sink
                    .event(id, now_ms(), EventDetails::SwitchError { error_type, code });
            }
        }
    }

    pub fn registry(&self) -> &Arc<DatapathRegistry> {
        &self.registry
    }

    pub fn flow_manager(&self) -> &FlowManager {
        &self.flows
    }

    pub fn poll_service(&self) -> &PollService {
        &self.polls
    }
}
