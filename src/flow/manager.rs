//! # Flow Manager
//!
//! Turns packets escalated by a switch into forwarding decisions:
//! learn the source, look up the destination, classify, install a stage-0
//! rule when the destination is known, and always echo the packet back out.
//!
//! Learning state is per datapath (see `learning`); the manager itself holds
//! no lock across a send.

use super::classify::{classify, Classification};
use super::learning::MacLearning;
use super::packet::parse_frame;
use crate::command::{
    FlowRuleIntent, OutputAction, PacketOut, PacketPayload, RuleAction, SwitchCommand,
    SwitchHandle, TableStage,
};
use crate::openflow::FlowMatch;
use crate::registry::DatapathRegistry;
use crate::telemetry::{EventDetails, PacketInSummary, TelemetrySink};
use crate::types::{now_ms, DatapathId, PortNo};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Timeouts applied to every learned rule. 0 = permanent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Seconds without traffic before the switch drops a learned rule
    pub idle_timeout: u16,
    /// Seconds after install before the switch drops a learned rule
    pub hard_timeout: u16,
}

/// What the manager decided for one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDecision {
    pub classification: Classification,
    pub priority: u16,
    pub output: OutputAction,
    /// Stage-0 rule sent to the switch; `None` when flooding.
    pub rule: Option<FlowRuleIntent>,
}

/// Counters since start
#[derive(Debug, Clone, Default)]
pub struct FlowManagerStats {
    pub packets_in: u64,
    pub rules_installed: u64,
    pub floods: u64,
    pub parse_errors: u64,
    pub unknown_switch: u64,
    pub commands_dropped: u64,
}

/// Live counters, bumped lock-free from every packet-in
#[derive(Default)]
struct FlowCounters {
    packets_in: AtomicU64,
    rules_installed: AtomicU64,
    floods: AtomicU64,
    parse_errors: AtomicU64,
    unknown_switch: AtomicU64,
    commands_dropped: AtomicU64,
}

impl FlowCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FlowManagerStats {
        FlowManagerStats {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            rules_installed: self.rules_installed.load(Ordering::Relaxed),
            floods: self.floods.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            unknown_switch: self.unknown_switch.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct FlowManager {
    registry: Arc<DatapathRegistry>,
    learning: MacLearning,
    sink: Arc<dyn TelemetrySink>,
    config: FlowConfig,
    counters: FlowCounters,
}

impl FlowManager {
    pub fn new(
        registry: Arc<DatapathRegistry>,
        sink: Arc<dyn TelemetrySink>,
        config: FlowConfig,
    ) -> Self {
        FlowManager {
            registry,
            learning: MacLearning::new(),
            sink,
            config,
            counters: FlowCounters::default(),
        }
    }

    /// The two rules every datapath starts with.
    pub fn baseline_pipeline() -> [FlowRuleIntent; 2] {
        [
            FlowRuleIntent {
                stage: TableStage::Learned,
                priority: 0,
                matcher: FlowMatch::any(),
                action: RuleAction::GotoStage(TableStage::Miss),
                idle_timeout: 0,
                hard_timeout: 0,
                notify_removal: false,
            },
            FlowRuleIntent {
                stage: TableStage::Miss,
                priority: 0,
                matcher: FlowMatch::any(),
                action: RuleAction::ToController,
                idle_timeout: 0,
                hard_timeout: 0,
                notify_removal: false,
            },
        ]
    }

    /// Resets learning for `id` and installs the baseline pipeline.
    ///
    /// Expects `id` to be registered already.
    pub fn on_switch_connected(&self, id: DatapathId) {
        self.learning.reset(id);

        let handle = match self.registry.handle(id) {
            Some(handle) => handle,
            None => {
                debug!("Switch {} left before its pipeline was installed", id);
                return;
            }
        };

        for intent in Self::baseline_pipeline() {
            self.dispatch(id, handle.as_ref(), SwitchCommand::InstallRule(intent));
        }
        info!("Installed baseline pipeline on switch {}", id);
    }

    /// Learning tables outlive the connection; reconnect resets them.
    pub fn on_switch_disconnected(&self, id: DatapathId) {
        debug!(
            "Switch {} disconnected with {} learned addresses",
            id,
            self.learning.entries(id).len()
        );
    }

    pub fn on_packet_in(
        &self,
        id: DatapathId,
        in_port: PortNo,
        data: &[u8],
        buffer_id: Option<u32>,
    ) -> Option<PacketDecision> {
        FlowCounters::bump(&self.counters.packets_in);

        let handle = match self.registry.handle(id) {
            Some(handle) => handle,
            None => {
                FlowCounters::bump(&self.counters.unknown_switch);
                debug!("Ignoring packet-in from unregistered switch {}", id);
                return None;
            }
        };

        let packet = match parse_frame(data) {
            Ok(packet) => packet,
            Err(reason) => {
                FlowCounters::bump(&self.counters.parse_errors);
                debug!("Dropping packet from switch {} port {}: {}", id, in_port, reason);
                self.sink.event(
                    id,
                    now_ms(),
                    EventDetails::ParseError {
                        in_port,
                        length: data.len(),
                        reason,
                    },
                );
                return None;
            }
        };

        let learned = self
            .learning
            .learn_and_lookup(id, packet.eth_src, in_port, packet.eth_dst);
        if let Some(previous) = learned.moved_from {
            debug!(
                "Switch {}: {} moved from port {} to {}",
                id, packet.eth_src, previous, in_port
            );
        }

        let output = match learned.dst_port {
            Some(port) => OutputAction::Port(port),
            None => OutputAction::Flood,
        };

        let class = classify(&packet, in_port);
        trace!(
            "Switch {}: {} -> {} on port {} classified {} (priority {}), output {}",
            id,
            packet.eth_src,
            packet.eth_dst,
            in_port,
            class.classification,
            class.priority,
            output
        );

        let rule = match output {
            OutputAction::Port(_) => Some(FlowRuleIntent {
                stage: TableStage::Learned,
                priority: class.priority,
                matcher: class.matcher.clone(),
                action: RuleAction::Output(output),
                idle_timeout: self.config.idle_timeout,
                hard_timeout: self.config.hard_timeout,
                notify_removal: true,
            }),
            OutputAction::Flood => None,
        };

        if let Some(ref intent) = rule {
            FlowCounters::bump(&self.counters.rules_installed);
            self.dispatch(id, handle.as_ref(), SwitchCommand::InstallRule(intent.clone()));
        } else {
            FlowCounters::bump(&self.counters.floods);
        }

        let payload = match buffer_id {
            Some(token) => PacketPayload::Buffered(token),
            None => PacketPayload::Raw(data.to_vec()),
        };
        self.dispatch(
            id,
            handle.as_ref(),
            SwitchCommand::PacketOut(PacketOut {
                payload,
                in_port,
                action: output,
            }),
        );

        self.sink.event(
            id,
            now_ms(),
            EventDetails::PacketIn(PacketInSummary {
                in_port,
                eth_src: packet.eth_src,
                eth_dst: packet.eth_dst,
                eth_type: packet.eth_type,
                classification: class.classification,
                priority: class.priority,
                output,
                rule_installed: rule.is_some(),
            }),
        );

        Some(PacketDecision {
            classification: class.classification,
            priority: class.priority,
            output,
            rule,
        })
    }

    /// Fire-and-forget send; a failure is counted and logged, never retried.
    fn dispatch(&self, id: DatapathId, handle: &dyn SwitchHandle, command: SwitchCommand) {
        let name = command.name();
        if let Err(e) = handle.send(command) {
            FlowCounters::bump(&self.counters.commands_dropped);
            debug!("Dropped {} for switch {}: {}", name, id, e);
        }
    }

    pub fn learning(&self) -> &MacLearning {
        &self.learning
    }

    pub fn config(&self) -> FlowConfig {
        self.config
    }

    pub fn stats(&self) -> FlowManagerStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::packet::build;
    use crate::telemetry::{EventType, MemorySink};
    use crate::types::MacAddr;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct RecordingHandle {
        sent: Mutex<Vec<SwitchCommand>>,
    }

    impl SwitchHandle for RecordingHandle {
        fn send(&self, command: SwitchCommand) -> Result<(), String> {
            self.sent.lock().push(command);
            Ok(())
        }
    }

    struct ClosedHandle;

    impl SwitchHandle for ClosedHandle {
        fn send(&self, _command: SwitchCommand) -> Result<(), String> {
            Err("connection closed".to_string())
        }
    }

    const A: MacAddr = MacAddr([0, 0, 0, 0, 0xaa, 0xaa]);
    const B: MacAddr = MacAddr([0, 0, 0, 0, 0xbb, 0xbb]);

    fn setup() -> (FlowManager, Arc<RecordingHandle>, Arc<MemorySink>) {
        let registry = Arc::new(DatapathRegistry::new());
        let handle = Arc::new(RecordingHandle::default());
        registry.register(1, handle.clone());
        let sink = Arc::new(MemorySink::new());
        let manager = FlowManager::new(registry, sink.clone(), FlowConfig::default());
        (manager, handle, sink)
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn test_connect_installs_two_stage_pipeline() {
        let (manager, handle, _) = setup();
        manager.on_switch_connected(1);

        let sent = handle.sent.lock();
        assert_eq!(sent.len(), 2);
        match (&sent[0], &sent[1]) {
            (SwitchCommand::InstallRule(first), SwitchCommand::InstallRule(second)) => {
                assert_eq!(first.stage, TableStage::Learned);
                assert_eq!(first.action, RuleAction::GotoStage(TableStage::Miss));
                assert_eq!(second.stage, TableStage::Miss);
                assert_eq!(second.action, RuleAction::ToController);
                assert!(first.matcher.is_wildcard() && second.matcher.is_wildcard());
            }
            other => panic!("unexpected commands {:?}", other),
        }
    }

    #[test]
    fn test_unknown_destination_floods_without_rule() {
        let (manager, handle, _) = setup();
        let frame = build::tcp_frame(A, B, ip(1), ip(2), 51000, 80);

        let decision = manager.on_packet_in(1, 3, &frame, None).unwrap();
        assert_eq!(decision.output, OutputAction::Flood);
        assert!(decision.rule.is_none());

        let sent = handle.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            SwitchCommand::PacketOut(PacketOut { action: OutputAction::Flood, in_port: 3, .. })
        ));
    }

    #[test]
    fn test_known_destination_installs_rule_with_config_timeouts() {
        let registry = Arc::new(DatapathRegistry::new());
        let handle = Arc::new(RecordingHandle::default());
        registry.register(1, handle.clone());
        let manager = FlowManager::new(
            registry,
            Arc::new(MemorySink::new()),
            FlowConfig {
                idle_timeout: 10,
                hard_timeout: 60,
            },
        );

        manager.on_packet_in(1, 3, &build::arp_frame(A, MacAddr::BROADCAST), None);
        let decision = manager
            .on_packet_in(1, 5, &build::icmp_frame(B, A, ip(2), ip(1)), Some(42))
            .unwrap();

        let rule = decision.rule.unwrap();
        assert_eq!(rule.priority, 25);
        assert_eq!(rule.idle_timeout, 10);
        assert_eq!(rule.hard_timeout, 60);
        assert!(rule.notify_removal);
        assert_eq!(rule.action, RuleAction::Output(OutputAction::Port(3)));

        let sent = handle.sent.lock();
        assert!(matches!(
            sent.last(),
            Some(SwitchCommand::PacketOut(PacketOut {
                payload: PacketPayload::Buffered(42),
                action: OutputAction::Port(3),
                ..
            }))
        ));
    }

    #[test]
    fn test_runt_frame_emits_parse_error_only() {
        let (manager, handle, sink) = setup();
        assert!(manager.on_packet_in(1, 2, &[0u8; 6], None).is_none());

        assert!(handle.sent.lock().is_empty());
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ParseError);
        assert_eq!(manager.stats().parse_errors, 1);
    }

    #[test]
    fn test_unregistered_switch_is_noop() {
        let (manager, _, sink) = setup();
        let frame = build::arp_frame(A, B);
        assert!(manager.on_packet_in(9, 1, &frame, None).is_none());
        assert!(sink.is_empty());
        assert!(manager.learning().entries(9).is_empty());
    }

    #[test]
    fn test_dead_handle_is_logged_not_fatal() {
        let registry = Arc::new(DatapathRegistry::new());
        registry.register(1, Arc::new(ClosedHandle));
        let sink = Arc::new(MemorySink::new());
        let manager = FlowManager::new(registry, sink.clone(), FlowConfig::default());

        manager.on_switch_connected(1);
        let decision = manager.on_packet_in(1, 1, &build::arp_frame(A, B), None);
        assert!(decision.is_some());
        assert_eq!(manager.stats().commands_dropped, 3);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_reconnect_resets_learning() {
        let (manager, _, _) = setup();
        manager.on_packet_in(1, 3, &build::arp_frame(A, B), None);
        assert_eq!(manager.learning().entries(1).len(), 1);

        manager.on_switch_disconnected(1);
        assert_eq!(manager.learning().entries(1).len(), 1);

        manager.on_switch_connected(1);
        assert!(manager.learning().entries(1).is_empty());
    }

    #[test]
    fn test_counters_add_up_across_threads() {
        let registry = Arc::new(DatapathRegistry::new());
        let handles: Vec<Arc<RecordingHandle>> = (1..=4)
            .map(|dpid| {
                let handle = Arc::new(RecordingHandle::default());
                registry.register(dpid, handle.clone());
                handle
            })
            .collect();
        let manager = Arc::new(FlowManager::new(
            registry,
            Arc::new(MemorySink::new()),
            FlowConfig::default(),
        ));

        let workers: Vec<_> = (1..=4u64)
            .map(|dpid| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for port in 0..250u32 {
                        let frame = build::arp_frame(A, MacAddr::BROADCAST);
                        manager.on_packet_in(dpid, port % 8 + 1, &frame, None);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.packets_in, 1_000);
        assert_eq!(stats.floods, 1_000);
        assert_eq!(stats.rules_installed, 0);
        assert!(handles.iter().all(|h| h.sent.lock().len() == 250));
    }
}
