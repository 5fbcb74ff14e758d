//! # OpenFlow Transport
//!
//! TCP listener speaking OpenFlow 1.3 to switches.
//!
//! Per connection:
//! 1. HELLO + FEATURES_REQUEST, wait for FEATURES_REPLY (bounded by the
//!    handshake timeout); the reply's datapath id names the switch
//! 2. `SwitchConnected` with a `ConnectionHandle` backed by a bounded queue
//!    drained by a writer task
//! 3. Read loop: decode, answer echoes, turn everything else into events and
//!    dispatch them in arrival order
//! 4. On EOF, I/O error, broken framing or shutdown: exactly one
//!    `SwitchDisconnected` naming this connection, so a late disconnect
//!    cannot remove a newer connection of the same switch
//!
//! A message whose body fails to decode is skipped; a broken header ends the
//! connection because the stream can no longer be framed.

use crate::command::{SwitchCommand, SwitchHandle};
use crate::controller::Controller;
use crate::event::ControllerEvent;
use crate::openflow::{
    Message, MultipartReplyBody, SwitchFeatures, WireError, OFP_HEADER_LEN, OFP_NO_BUFFER,
    OFP_VERSION,
};
use crate::types::{ConnectionId, DatapathId};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

const OFPT_HELLO: u8 = 0;
const HANDSHAKE_XID_HELLO: u32 = 1;
const HANDSHAKE_XID_FEATURES: u32 = 2;

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub listen_addr: String,
    /// Time allowed from accept to FEATURES_REPLY
    pub handshake_timeout_secs: u64,
    /// Controller-initiated echo period; 0 disables
    pub echo_interval_secs: u64,
    /// Commands queued per switch before sends start failing
    pub outbound_queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            listen_addr: "0.0.0.0:6653".to_string(),
            handshake_timeout_secs: 10,
            echo_interval_secs: 15,
            outbound_queue_depth: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

// ================================================================================================
// CONNECTION HANDLE
// ================================================================================================

/// One outbound message; `xid` is set only for replies that must echo a request's xid.
#[derive(Debug)]
struct Outbound {
    xid: Option<u32>,
    message: Message,
}

/// `SwitchHandle` for one TCP connection.
///
/// `send` never waits: a full queue or a closed connection fails immediately.
pub struct ConnectionHandle {
    id: DatapathId,
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    fn new(id: DatapathId, tx: mpsc::Sender<Outbound>) -> Self {
        ConnectionHandle {
            id,
            tx,
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

impl SwitchHandle for ConnectionHandle {
    fn send(&self, command: SwitchCommand) -> Result<(), String> {
        if self.is_closed() {
            return Err(format!("connection to switch {} is closed", self.id));
        }
        self.tx
            .try_send(Outbound {
                xid: None,
                message: command.to_message(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    format!("outbound queue for switch {} is full", self.id)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    format!("connection to switch {} is closed", self.id)
                }
            })
    }
}

// ================================================================================================
// SERVER
// ================================================================================================

pub struct OpenFlowServer {
    config: TransportConfig,
    controller: Arc<Controller>,
}

impl OpenFlowServer {
    pub fn new(config: TransportConfig, controller: Arc<Controller>) -> Self {
        OpenFlowServer { config, controller }
    }

    pub async fn bind(&self) -> Result<TcpListener, String> {
        TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", self.config.listen_addr, e))
    }

    /// Accepts switches until `shutdown` flips to true. Each connection runs
    /// in its own task and also stops on shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        match listener.local_addr() {
            Ok(addr) => info!("OpenFlow listener on {}", addr),
            Err(e) => warn!("OpenFlow listener address unavailable: {}", e),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("OpenFlow listener stopped");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();

        let handshake_timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let features = match timeout(handshake_timeout, handshake(&mut reader, &mut writer)).await {
            Ok(Ok(features)) => features,
            Ok(Err(e)) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Handshake with {} timed out after {}s",
                    peer, self.config.handshake_timeout_secs
                );
                return;
            }
        };

        let id = features.datapath_id;
        info!(
            "Switch {} handshake complete from {} ({} tables, {} buffers)",
            id, peer, features.n_tables, features.n_buffers
        );

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth.max(1));
        let writer_task = tokio::spawn(write_loop(id, writer, rx));
        let handle = Arc::new(ConnectionHandle::new(id, tx.clone()));

        let connection = ConnectionId::next();
        self.controller.dispatch(ControllerEvent::SwitchConnected {
            id,
            connection,
            handle: handle.clone(),
        });

        let echo_task = if self.config.echo_interval_secs > 0 {
            let period = Duration::from_secs(self.config.echo_interval_secs);
            Some(tokio::spawn(echo_loop(id, tx.clone(), period)))
        } else {
            None
        };

        let ended = self.read_loop(id, &mut reader, &tx, shutdown).await;
        match ended {
            Err(TransportError::Closed) => info!("Switch {} closed the connection", id),
            Err(e) => warn!("Switch {} connection ended: {}", id, e),
            Ok(()) => info!("Switch {} connection closed for shutdown", id),
        }

        handle.close();
        if let Some(task) = echo_task {
            task.abort();
        }
        drop(tx);
        writer_task.abort();

        self.controller
            .dispatch(ControllerEvent::SwitchDisconnected { id, connection });
    }

    /// Returns `Ok(())` on shutdown, the reason otherwise.
    async fn read_loop(
        &self,
        id: DatapathId,
        reader: &mut OwnedReadHalf,
        tx: &mpsc::Sender<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        loop {
            let frame = tokio::select! {
                frame = read_frame(reader) => frame?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };

            match Message::decode(&frame) {
                Ok((xid, message)) => self.handle_message(id, xid, message, tx),
                Err(e) => debug!("Skipping undecodable message from switch {}: {}", id, e),
            }
        }
    }

    fn handle_message(
        &self,
        id: DatapathId,
        xid: u32,
        message: Message,
        tx: &mpsc::Sender<Outbound>,
    ) {
        trace!("Switch {} sent {} (xid {})", id, message.name(), xid);

        let event = match message {
            Message::EchoRequest(data) => {
                let reply = Outbound {
                    xid: Some(xid),
                    message: Message::EchoReply(data),
                };
                if let Err(e) = tx.try_send(reply) {
                    debug!("Dropped echo reply for switch {}: {}", id, e);
                }
                return;
            }
            Message::PacketIn(packet_in) => {
                let in_port = match packet_in.in_port() {
                    Some(port) => port,
                    None => {
                        debug!("Packet-in from switch {} without in_port", id);
                        return;
                    }
                };
                let buffer_id = if packet_in.buffer_id == OFP_NO_BUFFER {
                    None
                } else {
                    Some(packet_in.buffer_id)
                };
                ControllerEvent::PacketIn {
                    id,
                    in_port,
                    data: packet_in.data,
                    buffer_id,
                }
            }
            Message::FlowRemoved(removed) => ControllerEvent::FlowRemoved { id, removed },
            Message::PortStatus(status) => ControllerEvent::PortStatus { id, status },
            Message::MultipartReply { body, .. } => match body {
                MultipartReplyBody::PortStats(stats) => ControllerEvent::PortStatsReply { id, stats },
                MultipartReplyBody::PortDesc(ports) => ControllerEvent::PortDescReply { id, ports },
                MultipartReplyBody::Flow(flows) => ControllerEvent::FlowStatsReply { id, flows },
                MultipartReplyBody::Table(tables) => {
                    ControllerEvent::TableStatsReply { id, tables }
                }
                MultipartReplyBody::Other { multipart_type } => {
                    debug!(
                        "Ignoring multipart reply type {} from switch {}",
                        multipart_type, id
                    );
                    return;
                }
            },
            Message::Error {
                error_type, code, ..
            } => ControllerEvent::SwitchError {
                id,
                error_type,
                code,
            },
            other => {
                debug!("Ignoring {} from switch {}", other.name(), id);
                return;
            }
        };

        self.controller.dispatch(event);
    }
}

// ================================================================================================
// WIRE HELPERS
// ================================================================================================

/// Sends HELLO and FEATURES_REQUEST, then reads until FEATURES_REPLY.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<SwitchFeatures, TransportError> {
    writer
        .write_all(&Message::Hello.encode(HANDSHAKE_XID_HELLO))
        .await?;
    writer
        .write_all(&Message::FeaturesRequest.encode(HANDSHAKE_XID_FEATURES))
        .await?;

    loop {
        let frame = read_frame(reader).await?;
        if frame[1] == OFPT_HELLO {
            continue;
        }
        match Message::decode(&frame)? {
            (_, Message::FeaturesReply(features)) => return Ok(features),
            (xid, Message::EchoRequest(data)) => {
                writer.write_all(&Message::EchoReply(data).encode(xid)).await?;
            }
            (_, Message::Error { error_type, code, .. }) => {
                return Err(TransportError::Handshake(format!(
                    "switch sent error type {} code {}",
                    error_type, code
                )));
            }
            (_, other) => trace!("Ignoring {} during handshake", other.name()),
        }
    }
}

/// Reads one complete message. HELLO is accepted whatever version the peer
/// advertises; anything else must be OpenFlow 1.3.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; OFP_HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(e),
        });
    }

    if header[0] != OFP_VERSION && header[1] != OFPT_HELLO {
        return Err(WireError::UnsupportedVersion(header[0]).into());
    }
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < OFP_HEADER_LEN {
        return Err(WireError::BadLength {
            what: "ofp_header",
            length,
        }
        .into());
    }

    let mut frame = vec![0u8; length];
    frame[..OFP_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[OFP_HEADER_LEN..]).await?;
    Ok(frame)
}

/// Drains the outbound queue onto the socket. Ends when every sender is
/// gone or a write fails.
async fn write_loop<W>(id: DatapathId, mut writer: W, mut rx: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let mut next_xid = HANDSHAKE_XID_FEATURES;
    while let Some(outbound) = rx.recv().await {
        let xid = outbound.xid.unwrap_or_else(|| {
            next_xid = next_xid.wrapping_add(1);
            next_xid
        });
        trace!("Sending {} to switch {} (xid {})", outbound.message.name(), id, xid);
        if let Err(e) = writer.write_all(&outbound.message.encode(xid)).await {
            debug!("Write to switch {} failed: {}", id, e);
            break;
        }
    }
    writer.shutdown().await.ok();
}

async fn echo_loop(id: DatapathId, tx: mpsc::Sender<Outbound>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let request = Outbound {
            xid: None,
            message: Message::EchoRequest(Vec::new()),
        };
        if let Err(e) = tx.try_send(request) {
            debug!("Dropped echo request for switch {}: {}", id, e);
            if tx.is_closed() {
                break;
            }
        }
    }
}
