//! Mock broker for testing
//!
//! [`MockBroker`] speaks just enough of the broker side of the protocol to
//! drive the client engine through connect, subscribe, publish and the
//! QoS handshakes, entirely in memory. Tests script its behavior (CONNACK
//! codes, session-present, ack suppression) and inspect every frame the
//! client sent.

use crate::codec::{self, ConnectReturnCode, ControlPacket, QoS, SubAckCode};
use crate::connection::{ByteStream, Connector};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

enum ServerCmd {
    Send(ControlPacket),
    Close,
}

struct BrokerInner {
    connack_code: StdMutex<ConnectReturnCode>,
    session_present: StdMutex<bool>,
    reject_filters: StdMutex<HashSet<String>>,
    received: StdMutex<Vec<ControlPacket>>,
    received_notify: Notify,
    to_client: StdMutex<Option<mpsc::UnboundedSender<ServerCmd>>>,
    connections: AtomicU32,
    auto_ack_publishes: AtomicBool,
    auto_pubrel: AtomicBool,
    auto_pingresp: AtomicBool,
    fail_dials: AtomicBool,
}

/// Scripted in-process broker
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

/// Connector handing the client an in-memory duplex to the broker
pub struct MockConnector {
    inner: Arc<BrokerInner>,
}

impl MockBroker {
    /// A broker that accepts connections and acknowledges everything.
    pub fn start() -> (MockBroker, Box<dyn Connector>) {
        let inner = Arc::new(BrokerInner {
            connack_code: StdMutex::new(ConnectReturnCode::Accepted),
            session_present: StdMutex::new(false),
            reject_filters: StdMutex::new(HashSet::new()),
            received: StdMutex::new(Vec::new()),
            received_notify: Notify::new(),
            to_client: StdMutex::new(None),
            connections: AtomicU32::new(0),
            auto_ack_publishes: AtomicBool::new(true),
            auto_pubrel: AtomicBool::new(true),
            auto_pingresp: AtomicBool::new(true),
            fail_dials: AtomicBool::new(false),
        });
        let broker = MockBroker {
            inner: Arc::clone(&inner),
        };
        let connector = Box::new(MockConnector { inner });
        (broker, connector)
    }

    /// Refuse subsequent transport dials, as an unreachable broker would.
    pub fn set_fail_dials(&self, enabled: bool) {
        self.inner.fail_dials.store(enabled, Ordering::SeqCst);
    }

    /// CONNACK return code for subsequent connection attempts.
    pub fn set_connack_code(&self, code: ConnectReturnCode) {
        *self.inner.connack_code.lock().unwrap() = code;
    }

    /// Whether subsequent CONNACKs report a resumed session.
    pub fn set_session_present(&self, present: bool) {
        *self.inner.session_present.lock().unwrap() = present;
    }

    /// Answer SUBSCRIBE for this filter with the failure code.
    pub fn reject_filter(&self, filter: &str) {
        self.inner
            .reject_filters
            .lock()
            .unwrap()
            .insert(filter.to_string());
    }

    /// Stop acknowledging client publishes (to exercise ack timeouts and
    /// duplicate handling by hand).
    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack_publishes.store(enabled, Ordering::SeqCst);
    }

    /// Stop answering PINGREQ (to exercise the keep-alive grace window).
    pub fn set_auto_pingresp(&self, enabled: bool) {
        self.inner.auto_pingresp.store(enabled, Ordering::SeqCst);
    }

    /// Stop answering the client's PUBREC with PUBREL, so tests control
    /// when an inbound QoS 2 handshake closes.
    pub fn set_auto_pubrel(&self, enabled: bool) {
        self.inner.auto_pubrel.store(enabled, Ordering::SeqCst);
    }

    /// Frames received from the client so far, CONNECT included.
    pub fn received(&self) -> Vec<ControlPacket> {
        self.inner.received.lock().unwrap().clone()
    }

    /// Number of transport connections accepted.
    pub fn connection_count(&self) -> u32 {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Push a frame to the currently connected client.
    pub fn send(&self, packet: ControlPacket) {
        let guard = self.inner.to_client.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(ServerCmd::Send(packet));
        }
    }

    /// Drop the current connection, as a broker crash would.
    pub fn drop_connection(&self) {
        let guard = self.inner.to_client.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(ServerCmd::Close);
        }
    }

    /// Wait until the client has sent at least `count` frames matching
    /// `predicate`.
    pub async fn wait_for_received<F>(&self, count: usize, predicate: F)
    where
        F: Fn(&ControlPacket) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let received = self.inner.received.lock().unwrap();
                if received.iter().filter(|p| predicate(p)).count() >= count {
                    return;
                }
            }
            let notified = self.inner.received_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let received = self.inner.received.lock().unwrap();
                panic!("timed out waiting for frames; broker saw: {received:?}");
            }
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> std::io::Result<ByteStream> {
        if self.inner.fail_dials.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock dial failure",
            ));
        }
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.inner.to_client.lock().unwrap();
            *guard = Some(to_client_tx);
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_connection(
            Arc::clone(&self.inner),
            server_side,
            to_client_rx,
        ));
        Ok(Box::new(client_side))
    }
}

async fn serve_connection(
    inner: Arc<BrokerInner>,
    stream: DuplexStream,
    mut commands: mpsc::UnboundedReceiver<ServerCmd>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(ServerCmd::Send(packet)) => {
                        if write_frame(&mut writer, &packet).await.is_err() {
                            return;
                        }
                    }
                    Some(ServerCmd::Close) | None => {
                        return;
                    }
                }
            }
            frame = read_one(&mut reader, &mut read_buf) => {
                let packet = match frame {
                    Some(packet) => packet,
                    None => return,
                };
                debug!(kind = packet.kind(), "mock broker received");
                record(&inner, packet.clone());

                let responses = respond_to(&inner, &packet);
                for response in responses {
                    if write_frame(&mut writer, &response).await.is_err() {
                        return;
                    }
                }
                if matches!(packet, ControlPacket::Disconnect) {
                    return;
                }
                if let ControlPacket::Connect(_) = packet {
                    let code = *inner.connack_code.lock().unwrap();
                    if code != ConnectReturnCode::Accepted {
                        return;
                    }
                }
            }
        }
    }
}

fn record(inner: &BrokerInner, packet: ControlPacket) {
    inner.received.lock().unwrap().push(packet);
    inner.received_notify.notify_waiters();
}

/// The broker-side scripted reactions to a client frame.
fn respond_to(inner: &BrokerInner, packet: &ControlPacket) -> Vec<ControlPacket> {
    match packet {
        ControlPacket::Connect(_) => {
            let code = *inner.connack_code.lock().unwrap();
            let session_present = *inner.session_present.lock().unwrap();
            vec![ControlPacket::ConnAck {
                session_present,
                code,
            }]
        }
        ControlPacket::Publish(publish) => {
            if !inner.auto_ack_publishes.load(Ordering::SeqCst) {
                return Vec::new();
            }
            match (publish.qos, publish.packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => {
                    vec![ControlPacket::PubAck { packet_id }]
                }
                (QoS::ExactlyOnce, Some(packet_id)) => {
                    vec![ControlPacket::PubRec { packet_id }]
                }
                _ => Vec::new(),
            }
        }
        ControlPacket::PubRel { packet_id } => {
            if inner.auto_ack_publishes.load(Ordering::SeqCst) {
                vec![ControlPacket::PubComp {
                    packet_id: *packet_id,
                }]
            } else {
                Vec::new()
            }
        }
        // Client's PUBREC for a broker-originated QoS 2 publish.
        ControlPacket::PubRec { packet_id } => {
            if inner.auto_pubrel.load(Ordering::SeqCst) {
                vec![ControlPacket::PubRel {
                    packet_id: *packet_id,
                }]
            } else {
                Vec::new()
            }
        }
        ControlPacket::Subscribe { packet_id, filters } => {
            let rejected = inner.reject_filters.lock().unwrap();
            let codes = filters
                .iter()
                .map(|(filter, qos)| {
                    if rejected.contains(filter) {
                        SubAckCode::Failure
                    } else {
                        match qos {
                            QoS::AtMostOnce => SubAckCode::GrantedQoS0,
                            QoS::AtLeastOnce => SubAckCode::GrantedQoS1,
                            QoS::ExactlyOnce => SubAckCode::GrantedQoS2,
                        }
                    }
                })
                .collect();
            vec![ControlPacket::SubAck {
                packet_id: *packet_id,
                codes,
            }]
        }
        ControlPacket::Unsubscribe { packet_id, .. } => {
            vec![ControlPacket::UnsubAck {
                packet_id: *packet_id,
            }]
        }
        ControlPacket::PingReq => {
            if inner.auto_pingresp.load(Ordering::SeqCst) {
                vec![ControlPacket::PingResp]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

async fn read_one(
    reader: &mut tokio::io::ReadHalf<DuplexStream>,
    buf: &mut BytesMut,
) -> Option<ControlPacket> {
    loop {
        match codec::decode(buf) {
            Ok(Some(packet)) => return Some(packet),
            Ok(None) => {}
            Err(_) => return None,
        }
        match reader.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn write_frame(
    writer: &mut tokio::io::WriteHalf<DuplexStream>,
    packet: &ControlPacket,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(128);
    codec::encode(packet, &mut buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&buf).await
}
