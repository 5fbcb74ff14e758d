//! Property tests for MAC learning and rule installation.
//!
//! Random packet-in sequences are replayed through a `FlowManager` and
//! checked against a model built from the same sequence:
//! - the learning table holds the last ingress port per source address
//! - a learned destination is never flooded
//! - a flood never comes with an install-rule
//! - transport rules outrank IP, ARP and link rules

use fabric::command::{OutputAction, SwitchCommand, SwitchHandle};
use fabric::flow::classify::{PRIORITY_ARP, PRIORITY_IP, PRIORITY_LINK, PRIORITY_TRANSPORT};
use fabric::flow::packet::build;
use fabric::flow::{classify, parse_frame, Classification, FlowConfig, FlowManager};
use fabric::telemetry::MemorySink;
use fabric::{DatapathRegistry, MacAddr};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

const DPID: u64 = 7;
const HOSTS: u8 = 8;

#[derive(Default)]
struct RecordingSwitch {
    sent: Mutex<Vec<SwitchCommand>>,
}

impl SwitchHandle for RecordingSwitch {
    fn send(&self, command: SwitchCommand) -> Result<(), String> {
        self.sent.lock().push(command);
        Ok(())
    }
}

/// One packet-in: source host, destination host (`HOSTS` = broadcast),
/// ingress port and packet shape.
#[derive(Clone, Debug)]
struct Arrival {
    src: u8,
    dst: u8,
    in_port: u32,
    shape: u8,
}

fn host_mac(i: u8) -> MacAddr {
    if i >= HOSTS {
        MacAddr::BROADCAST
    } else {
        MacAddr([0x02, 0, 0, 0, 0, i + 1])
    }
}

fn host_ip(i: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, i.saturating_add(1))
}

fn frame_for(a: &Arrival) -> Vec<u8> {
    let (src, dst) = (host_mac(a.src), host_mac(a.dst));
    let (ip_src, ip_dst) = (host_ip(a.src), host_ip(a.dst));
    match a.shape {
        0 => build::arp_frame(src, dst),
        1 => build::tcp_frame(src, dst, ip_src, ip_dst, 40000 + a.src as u16, 80),
        2 => build::udp_frame(src, dst, ip_src, ip_dst, 5353, 53),
        3 => build::icmp_frame(src, dst, ip_src, ip_dst),
        _ => build::ethernet(dst, src, 0x88cc, &[0u8; 46]),
    }
}

fn arb_arrival() -> impl Strategy<Value = Arrival> {
    (0..HOSTS, 0..=HOSTS, 1u32..=48, 0u8..5).prop_map(|(src, dst, in_port, shape)| Arrival {
        src,
        dst,
        in_port,
        shape,
    })
}

fn setup() -> (FlowManager, Arc<RecordingSwitch>) {
    let registry = Arc::new(DatapathRegistry::new());
    let switch = Arc::new(RecordingSwitch::default());
    registry.register(DPID, switch.clone());
    let manager = FlowManager::new(registry, Arc::new(MemorySink::new()), FlowConfig::default());
    (manager, switch)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn learning_table_keeps_last_port(arrivals in prop::collection::vec(arb_arrival(), 1..64)) {
        let (manager, _switch) = setup();
        let mut expected: HashMap<MacAddr, u32> = HashMap::new();

        for a in &arrivals {
            manager.on_packet_in(DPID, a.in_port, &frame_for(a), None);
            expected.insert(host_mac(a.src), a.in_port);
        }

        prop_assert_eq!(manager.learning().entries(DPID), expected);
    }

    #[test]
    fn learned_destination_is_never_flooded(arrivals in prop::collection::vec(arb_arrival(), 1..64)) {
        let (manager, _switch) = setup();
        let mut model: HashMap<MacAddr, u32> = HashMap::new();

        for a in &arrivals {
            let decision = manager.on_packet_in(DPID, a.in_port, &frame_for(a), None);
            prop_assert!(decision.is_some());
            let decision = decision.unwrap();

            model.insert(host_mac(a.src), a.in_port);
            let expected = match model.get(&host_mac(a.dst)) {
                Some(&port) => OutputAction::Port(port),
                None => OutputAction::Flood,
            };
            prop_assert_eq!(decision.output, expected);
        }
    }

    #[test]
    fn flood_never_installs_a_rule(arrivals in prop::collection::vec(arb_arrival(), 1..64)) {
        let (manager, switch) = setup();
        let mut expected_installs = 0usize;

        for a in &arrivals {
            let before = switch.sent.lock().len();
            let decision = manager.on_packet_in(DPID, a.in_port, &frame_for(a), None).unwrap();
            let sent: Vec<SwitchCommand> = switch.sent.lock()[before..].to_vec();
            let installs = sent
                .iter()
                .filter(|c| matches!(c, SwitchCommand::InstallRule(_)))
                .count();

            if decision.output.is_flood() {
                prop_assert!(decision.rule.is_none());
                prop_assert_eq!(installs, 0);
            } else {
                prop_assert!(decision.rule.is_some());
                prop_assert_eq!(installs, 1);
                expected_installs += 1;
            }
            // Exactly one packet-out per packet-in, after any install
            prop_assert!(matches!(sent.last(), Some(SwitchCommand::PacketOut(_))));
        }

        prop_assert_eq!(manager.stats().rules_installed as usize, expected_installs);
    }

    #[test]
    fn transport_rules_outrank_the_rest(a in arb_arrival()) {
        let packet = parse_frame(&frame_for(&a)).unwrap();
        let class = classify(&packet, a.in_port);

        prop_assert_eq!(class.matcher.in_port, Some(a.in_port));
        prop_assert_eq!(class.priority, class.classification.priority());
        match class.classification {
            Classification::Tcp => {
                prop_assert_eq!(class.priority, PRIORITY_TRANSPORT);
                prop_assert!(class.matcher.ipv4_src.is_some() && class.matcher.ipv4_dst.is_some());
                prop_assert!(class.matcher.tcp_src.is_some() && class.matcher.tcp_dst.is_some());
            }
            Classification::Udp => {
                prop_assert_eq!(class.priority, PRIORITY_TRANSPORT);
                prop_assert!(class.matcher.ipv4_src.is_some() && class.matcher.ipv4_dst.is_some());
                prop_assert!(class.matcher.udp_src.is_some() && class.matcher.udp_dst.is_some());
            }
            Classification::Ip => {
                prop_assert_eq!(class.priority, PRIORITY_IP);
            }
            Classification::Arp => {
                prop_assert_eq!(class.priority, PRIORITY_ARP);
            }
            Classification::Link => {
                prop_assert_eq!(class.priority, PRIORITY_LINK);
            }
        }
    }
}

#[test]
fn test_priority_tiers_are_strictly_ordered() {
    let tiers = [
        Classification::Tcp,
        Classification::Ip,
        Classification::Arp,
        Classification::Link,
    ];
    for pair in tiers.windows(2) {
        assert!(pair[0].priority() > pair[1].priority(), "{} vs {}", pair[0], pair[1]);
    }
    assert_eq!(Classification::Udp.priority(), Classification::Tcp.priority());
}
