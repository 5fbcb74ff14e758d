//! A scripted switch talking OpenFlow 1.3 to a live listener over loopback TCP.
//!
//! Tests verify:
//! - Handshake, baseline pipeline and port description request on connect
//! - Packet-in answered by packet-out; echo answered with the request's xid
//! - Stats replies reach the telemetry sink
//! - Exactly one disconnect when the switch hangs up or the listener shuts down

use fabric::flow::packet::build;
use fabric::flow::FlowConfig;
use fabric::openflow::{
    Action, FlowMatch, Message, MultipartReplyBody, MultipartRequest, PacketIn, PortStats,
    SwitchFeatures, OFPP_FLOOD, OFP_NO_BUFFER,
};
use fabric::telemetry::{EventType, MemorySink, RecordKind};
use fabric::transport::{read_frame, OpenFlowServer, TransportConfig};
use fabric::{Controller, DatapathRegistry, MacAddr};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const DPID: u64 = 0x00_00_00_00_00_00_0a_01;

struct Running {
    addr: SocketAddr,
    controller: Arc<Controller>,
    sink: Arc<MemorySink>,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
}

async fn start_listener() -> Running {
    let sink = Arc::new(MemorySink::new());
    let controller = Arc::new(Controller::new(
        Arc::new(DatapathRegistry::new()),
        sink.clone(),
        FlowConfig::default(),
    ));
    let config = TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        handshake_timeout_secs: 2,
        echo_interval_secs: 0,
        outbound_queue_depth: 64,
    };
    let server = Arc::new(OpenFlowServer::new(config, controller.clone()));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server.serve(listener, shutdown_rx));

    Running {
        addr,
        controller,
        sink,
        shutdown,
        server,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let waited = timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

struct FakeSwitch {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl FakeSwitch {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        FakeSwitch { reader, writer }
    }

    async fn send(&mut self, xid: u32, message: Message) {
        self.writer.write_all(&message.encode(xid)).await.unwrap();
    }

    async fn recv(&mut self) -> (u32, Message) {
        let frame = timeout(Duration::from_secs(3), read_frame(&mut self.reader))
            .await
            .expect("controller went quiet")
            .unwrap();
        Message::decode(&frame).unwrap()
    }

    /// Answers HELLO and FEATURES_REQUEST with the given datapath id.
    async fn handshake(&mut self, datapath_id: u64) {
        self.send(1, Message::Hello).await;

        let (_, hello) = self.recv().await;
        assert_eq!(hello, Message::Hello);
        let (xid, request) = self.recv().await;
        assert_eq!(request, Message::FeaturesRequest);

        self.send(
            xid,
            Message::FeaturesReply(SwitchFeatures {
                datapath_id,
                n_buffers: 256,
                n_tables: 254,
                auxiliary_id: 0,
                capabilities: 0x4f,
            }),
        )
        .await;
    }
}

fn packet_in(in_port: u32, data: Vec<u8>) -> Message {
    Message::PacketIn(PacketIn {
        buffer_id: OFP_NO_BUFFER,
        total_len: data.len() as u16,
        reason: 0,
        table_id: 1,
        cookie: 0,
        matcher: FlowMatch {
            in_port: Some(in_port),
            ..FlowMatch::default()
        },
        data,
    })
}

#[tokio::test]
async fn test_switch_session_over_tcp() {
    let running = start_listener().await;
    let mut switch = FakeSwitch::connect(running.addr).await;
    switch.handshake(DPID).await;

    // Baseline pipeline, then the port description request
    let mut tables = Vec::new();
    for _ in 0..2 {
        match switch.recv().await {
            (_, Message::FlowMod(flow_mod)) => {
                assert_eq!(flow_mod.priority, 0);
                tables.push(flow_mod.table_id);
            }
            (_, other) => panic!("expected FLOW_MOD, got {}", other.name()),
        }
    }
    assert_eq!(tables, vec![0, 1]);
    let (_, request) = switch.recv().await;
    assert_eq!(request, Message::MultipartRequest(MultipartRequest::PortDesc));

    assert!(running.controller.registry().is_connected(DPID));

    // Unknown destination floods
    let frame = build::arp_frame(MacAddr([0x02, 0, 0, 0, 0, 1]), MacAddr::BROADCAST);
    switch.send(10, packet_in(3, frame.clone())).await;
    match switch.recv().await {
        (_, Message::PacketOut {
            buffer_id,
            in_port,
            actions,
            data,
        }) => {
            assert_eq!(buffer_id, OFP_NO_BUFFER);
            assert_eq!(in_port, 3);
            assert_eq!(data, frame);
            assert!(matches!(
                actions.as_slice(),
                [Action::Output { port: OFPP_FLOOD, .. }]
            ));
        }
        (_, other) => panic!("expected PACKET_OUT, got {}", other.name()),
    }

    // Echo keeps the request's xid
    switch.send(77, Message::EchoRequest(b"ping".to_vec())).await;
    let (xid, reply) = switch.recv().await;
    assert_eq!(xid, 77);
    assert_eq!(reply, Message::EchoReply(b"ping".to_vec()));

    // Stats reply becomes telemetry
    switch
        .send(
            11,
            Message::MultipartReply {
                flags: 0,
                body: MultipartReplyBody::PortStats(vec![PortStats {
                    port_no: 3,
                    rx_packets: 12,
                    ..PortStats::default()
                }]),
            },
        )
        .await;
    let sink = running.sink.clone();
    wait_until("port stats record", move || {
        sink.of_kind(RecordKind::PortStats).len() == 1
    })
    .await;

    // Hang up
    drop(switch);
    let controller = running.controller.clone();
    wait_until("switch removal", move || {
        !controller.registry().is_connected(DPID)
    })
    .await;

    let disconnects = running
        .sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::SwitchDisconnected)
        .count();
    assert_eq!(disconnects, 1);

    running.shutdown.send(true).unwrap();
    timeout(Duration::from_secs(3), running.server)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_disconnects_switches() {
    let running = start_listener().await;
    let mut switch = FakeSwitch::connect(running.addr).await;
    switch.handshake(DPID).await;

    let controller = running.controller.clone();
    wait_until("registration", move || {
        controller.registry().is_connected(DPID)
    })
    .await;

    running.shutdown.send(true).unwrap();
    timeout(Duration::from_secs(3), running.server)
        .await
        .unwrap()
        .unwrap();

    let controller = running.controller.clone();
    wait_until("switch removal", move || controller.registry().is_empty()).await;
    drop(switch);
}

#[tokio::test]
async fn test_reconnect_survives_old_connection_hangup() {
    let running = start_listener().await;
    let mut first = FakeSwitch::connect(running.addr).await;
    first.handshake(DPID).await;
    let controller = running.controller.clone();
    wait_until("first registration", move || {
        controller.registry().is_connected(DPID)
    })
    .await;
    let first_connection = running.controller.registry().connection(DPID);

    // Same switch comes back on a new socket before the old one is closed
    let mut second = FakeSwitch::connect(running.addr).await;
    second.handshake(DPID).await;
    let controller = running.controller.clone();
    wait_until("second registration", move || {
        controller.registry().connection(DPID) != first_connection
    })
    .await;
    for _ in 0..3 {
        second.recv().await;
    }

    drop(first);
    sleep(Duration::from_millis(200)).await;
    assert!(running.controller.registry().is_connected(DPID));

    let frame = build::arp_frame(MacAddr([0x02, 0, 0, 0, 0, 9]), MacAddr::BROADCAST);
    second.send(20, packet_in(4, frame)).await;
    match second.recv().await {
        (_, Message::PacketOut { in_port, .. }) => assert_eq!(in_port, 4),
        (_, other) => panic!("expected PACKET_OUT, got {}", other.name()),
    }

    let disconnects = running
        .sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::SwitchDisconnected)
        .count();
    assert_eq!(disconnects, 0);

    running.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_handshake_error_never_registers() {
    let running = start_listener().await;
    let mut switch = FakeSwitch::connect(running.addr).await;

    switch.send(1, Message::Hello).await;
    let _ = switch.recv().await;
    let _ = switch.recv().await;
    switch
        .send(
            2,
            Message::Error {
                error_type: 0,
                code: 0,
                data: Vec::new(),
            },
        )
        .await;

    // The listener closes the socket without ever registering the switch
    let closed = timeout(Duration::from_secs(3), read_frame(&mut switch.reader)).await;
    assert!(matches!(closed, Ok(Err(_))));
    assert!(running.controller.registry().is_empty());
    assert!(running.sink.is_empty());

    running.shutdown.send(true).unwrap();
}
