//! Connection manager
//!
//! Owns the transport connection for one session: the CONNECT/CONNACK
//! exchange, a single event loop that is the only writer of outbound
//! frames, keep-alive pings with a grace window, and the reconnection
//! supervisor with exponential backoff and jitter. Decoded inbound frames
//! are routed to the session state machine and the dispatcher.

mod transport;

pub use transport::{ByteStream, Connector, StreamIo, TcpConnector};

use crate::codec::{self, Connect, ControlPacket, LastWill, Publish, QoS};
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::error::{escalate_decode_error, MqttError, MqttResult};
use crate::session::{AckAction, InboundDisposition, SessionCore, SessionEvent, SessionState};
use bytes::BytesMut;
use rand::Rng;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Requests from client handles to the event loop
#[derive(Debug)]
pub(crate) enum Command {
    /// Write a control packet (SUBSCRIBE/UNSUBSCRIBE with pre-registered
    /// waiters)
    Send(ControlPacket),
    /// Graceful shutdown: DISCONNECT packet, then stop
    Disconnect,
}

/// Mutable connection health, updated by the event loop
#[derive(Debug, Default)]
pub(crate) struct HealthState {
    connected_at: Option<Instant>,
    last_inbound: Option<Instant>,
    reconnect_count: u32,
}

/// Point-in-time connection health
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub uptime: Option<Duration>,
    pub time_since_last_inbound: Option<Duration>,
    pub reconnect_count: u32,
}

pub(crate) fn health_snapshot(health: &StdMutex<HealthState>) -> HealthSnapshot {
    let health = health.lock().unwrap();
    let now = Instant::now();
    HealthSnapshot {
        uptime: health.connected_at.map(|t| now.duration_since(t)),
        time_since_last_inbound: health.last_inbound.map(|t| now.duration_since(t)),
        reconnect_count: health.reconnect_count,
    }
}

/// What woke the connected event loop
enum LoopEvent {
    Command(Option<Command>),
    ActionsReady,
    Frame(MqttResult<ControlPacket>),
    Outbound(Option<Publish>),
    TimerFired,
}

/// Why the connected event loop ended
enum LoopExit {
    /// Application asked for a disconnect (or dropped the client)
    Graceful,
    /// Structural error: session is torn down, no reconnect
    Fatal(MqttError),
    /// Transport-level loss: reconnect policy applies
    Lost(String),
}

/// The connection supervisor: dials, runs the event loop, reconnects.
pub(crate) struct Supervisor {
    pub(crate) config: ClientConfig,
    pub(crate) client_id: String,
    pub(crate) connector: Box<dyn Connector>,
    pub(crate) core: Arc<StdMutex<SessionCore>>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) data_rx: mpsc::Receiver<Publish>,
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<Command>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) health: Arc<StdMutex<HealthState>>,
    /// Resolves the initial `connect()` call once CONNACK arrives
    pub(crate) connect_gate: Option<oneshot::Sender<MqttResult<()>>>,
}

impl Supervisor {
    pub(crate) async fn run(mut self) {
        let mut attempts: u32 = 0;

        loop {
            {
                let mut core = self.core.lock().unwrap();
                core.apply(&SessionEvent::ConnectStarted);
            }
            let _ = self.state_tx.send(SessionState::Connecting);

            let establish = tokio::time::timeout(
                self.config.connect_timeout(),
                self.establish(),
            )
            .await
            .unwrap_or(Err(MqttError::ConnectTimeout {
                seconds: self.config.connect_timeout_secs,
            }));

            match establish {
                Ok((reader, writer, read_buf, session_present)) => {
                    attempts = 0;
                    match self
                        .run_connected(reader, writer, read_buf, session_present)
                        .await
                    {
                        LoopExit::Graceful => {
                            self.teardown("client disconnected");
                            return;
                        }
                        LoopExit::Fatal(err) => {
                            error!(error = %err, "session torn down");
                            self.teardown(&err.to_string());
                            return;
                        }
                        LoopExit::Lost(reason) => {
                            {
                                let mut core = self.core.lock().unwrap();
                                core.connection_lost(&reason);
                            }
                            let _ = self.state_tx.send(SessionState::Disconnected);
                            {
                                let mut health = self.health.lock().unwrap();
                                health.connected_at = None;
                            }
                        }
                    }
                }
                Err(err) => {
                    // Before the first CONNACK the caller is still waiting
                    // in connect(): surface the error there and stop.
                    if let Some(gate) = self.connect_gate.take() {
                        self.teardown(&err.to_string());
                        let _ = gate.send(Err(err));
                        return;
                    }
                    if err.is_fatal() {
                        error!(error = %err, "broker rejected reconnect; giving up");
                        self.teardown(&err.to_string());
                        return;
                    }
                    warn!(error = %err, "reconnect attempt failed");
                    {
                        let mut core = self.core.lock().unwrap();
                        core.connection_lost(&err.to_string());
                    }
                    let _ = self.state_tx.send(SessionState::Disconnected);
                }
            }

            // Reconnect decision.
            if !self.config.reconnect.allows_attempt(attempts) {
                let reason = if self.config.reconnect.enabled {
                    "reconnect attempts exhausted"
                } else {
                    "reconnect disabled"
                };
                info!(reason, "not reconnecting");
                self.teardown(reason);
                return;
            }
            attempts += 1;
            {
                let mut health = self.health.lock().unwrap();
                health.reconnect_count = health.reconnect_count.saturating_add(1);
            }

            let delay = backoff_with_jitter(&self.config, attempts);
            info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
            if !self.interruptible_sleep(delay).await {
                self.teardown("client disconnected");
                return;
            }
        }
    }

    /// Dial the transport and run the CONNECT/CONNACK exchange.
    async fn establish(
        &mut self,
    ) -> MqttResult<(
        ReadHalf<ByteStream>,
        WriteHalf<ByteStream>,
        BytesMut,
        bool,
    )> {
        let stream = self
            .connector
            .connect()
            .await
            .map_err(MqttError::Transport)?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (username, password) = match self.config.resolve_credentials() {
            Some((username, password)) => (Some(username), Some(password)),
            None => (None, None),
        };
        let connect = ControlPacket::Connect(Connect {
            client_id: self.client_id.clone(),
            clean_session: self.config.clean_start,
            keep_alive_secs: self.config.keep_alive_secs,
            last_will: self.config.last_will.as_ref().map(|will| LastWill {
                topic: will.topic.clone(),
                payload: will.payload.clone().into_bytes().into(),
                qos: QoS::from_u8(will.qos).unwrap_or(QoS::AtMostOnce),
                retain: will.retain,
            }),
            username,
            password,
        });
        write_packet(&mut writer, &connect).await?;

        let mut read_buf = BytesMut::with_capacity(4096);
        let packet = read_frame(&mut reader, &mut read_buf).await?;
        match packet {
            ControlPacket::ConnAck {
                session_present,
                code: codec::ConnectReturnCode::Accepted,
            } => {
                debug!(session_present, "CONNACK accepted");
                Ok((reader, writer, read_buf, session_present))
            }
            ControlPacket::ConnAck { code, .. } => Err(MqttError::ProtocolRejected { code }),
            other => Err(MqttError::violation(format!(
                "expected CONNACK, got {}",
                other.kind()
            ))),
        }
    }

    /// The connected event loop. Sole writer of outbound frames.
    async fn run_connected(
        &mut self,
        mut reader: ReadHalf<ByteStream>,
        mut writer: WriteHalf<ByteStream>,
        mut read_buf: BytesMut,
        session_present: bool,
    ) -> LoopExit {
        let resumed = session_present && !self.config.clean_start;
        let replay = {
            let mut core = self.core.lock().unwrap();
            core.on_connected(resumed)
        };
        if !resumed {
            // Acknowledgments queued for the previous session are void.
            self.dispatcher.clear_ready_acks();
        }
        let _ = self.state_tx.send(SessionState::Connected);
        {
            let mut health = self.health.lock().unwrap();
            health.connected_at = Some(Instant::now());
        }
        if let Some(gate) = self.connect_gate.take() {
            let _ = gate.send(Ok(()));
        }

        let mut last_write = Instant::now();

        for frame in replay {
            if let Err(err) = write_packet(&mut writer, &frame).await {
                return LoopExit::Lost(err.to_string());
            }
            last_write = Instant::now();
            if let ControlPacket::PubRel { packet_id } = frame {
                self.core.lock().unwrap().outbound.mark_pubrel_sent(packet_id);
            }
        }

        // Re-establish the subscription registry on the broker.
        for (filter, qos) in self.dispatcher.resubscribe_filters() {
            let subscribe = {
                let mut core = self.core.lock().unwrap();
                match core.packet_ids.acquire() {
                    Ok(packet_id) => {
                        let (waiter, _discard) = oneshot::channel();
                        core.register_suback_waiter(packet_id, waiter);
                        ControlPacket::Subscribe {
                            packet_id,
                            filters: vec![(filter.clone(), qos)],
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, filter = %filter, "cannot resubscribe");
                        continue;
                    }
                }
            };
            if let Err(err) = write_packet(&mut writer, &subscribe).await {
                return LoopExit::Lost(err.to_string());
            }
            last_write = Instant::now();
        }

        let keep_alive = Duration::from_secs(u64::from(self.config.keep_alive_secs));
        let keep_alive_enabled = !keep_alive.is_zero();
        let grace = std::cmp::max(keep_alive / 2, Duration::from_secs(1));
        let mut pong_deadline: Option<Instant> = None;

        loop {
            // Drain queued dispatcher actions first; the notify arm below
            // only wakes the loop, it is not the sole delivery path.
            if let Err(err) = self.flush_ready_actions(&mut writer, &mut last_write).await {
                return LoopExit::Lost(err.to_string());
            }

            let ping_at = last_write + keep_alive;
            let wake_at = match pong_deadline {
                Some(deadline) => std::cmp::min(deadline, ping_at),
                None => ping_at,
            };

            // Arms only capture the event; processing happens below so the
            // handlers are free to use the whole supervisor.
            let event = tokio::select! {
                biased;

                command = self.cmd_rx.recv() => LoopEvent::Command(command),
                _ = self.dispatcher.actions_ready.notified() => LoopEvent::ActionsReady,
                read_result = read_frame(&mut reader, &mut read_buf) => {
                    LoopEvent::Frame(read_result)
                }
                publish = self.data_rx.recv() => LoopEvent::Outbound(publish),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)),
                    if keep_alive_enabled => LoopEvent::TimerFired,
            };

            match event {
                LoopEvent::Command(Some(Command::Send(packet))) => {
                    if let Err(err) = write_packet(&mut writer, &packet).await {
                        return LoopExit::Lost(err.to_string());
                    }
                    last_write = Instant::now();
                }
                LoopEvent::Command(Some(Command::Disconnect)) | LoopEvent::Command(None) => {
                    {
                        let mut core = self.core.lock().unwrap();
                        core.apply(&SessionEvent::DisconnectStarted);
                    }
                    let _ = self.state_tx.send(SessionState::Disconnecting);
                    if let Err(err) = write_packet(&mut writer, &ControlPacket::Disconnect).await
                    {
                        debug!(error = %err, "DISCONNECT write failed during shutdown");
                    }
                    let _ = writer.shutdown().await;
                    return LoopExit::Graceful;
                }
                LoopEvent::ActionsReady => {
                    // Work happens in the top-of-loop drain.
                }
                LoopEvent::Frame(Ok(packet)) => {
                    {
                        let mut health = self.health.lock().unwrap();
                        health.last_inbound = Some(Instant::now());
                    }
                    match self
                        .handle_incoming(packet, &mut writer, &mut pong_deadline)
                        .await
                    {
                        Ok(wrote) => {
                            if wrote {
                                last_write = Instant::now();
                            }
                        }
                        Err(err) if err.is_fatal() => return LoopExit::Fatal(err),
                        Err(err) => return LoopExit::Lost(err.to_string()),
                    }
                }
                LoopEvent::Frame(Err(err)) if err.is_fatal() => return LoopExit::Fatal(err),
                LoopEvent::Frame(Err(err)) => return LoopExit::Lost(err.to_string()),
                LoopEvent::Outbound(Some(publish)) => {
                    let packet_id = publish.packet_id;
                    let tracked = publish.qos != QoS::AtMostOnce;
                    if let Err(err) =
                        write_packet(&mut writer, &ControlPacket::Publish(publish)).await
                    {
                        return LoopExit::Lost(err.to_string());
                    }
                    last_write = Instant::now();
                    if tracked {
                        if let Some(packet_id) = packet_id {
                            self.core.lock().unwrap().outbound.mark_written(packet_id);
                        }
                    }
                }
                LoopEvent::Outbound(None) => {
                    // Every client handle dropped: shut down cleanly.
                    let _ = write_packet(&mut writer, &ControlPacket::Disconnect).await;
                    let _ = writer.shutdown().await;
                    return LoopExit::Graceful;
                }
                LoopEvent::TimerFired => {
                    let now = Instant::now();
                    if let Some(deadline) = pong_deadline {
                        if now >= deadline {
                            let err = MqttError::KeepAliveTimeout {
                                seconds: grace.as_secs(),
                            };
                            warn!(error = %err, "keep-alive expired");
                            return LoopExit::Lost(err.to_string());
                        }
                    }
                    if now >= ping_at {
                        if let Err(err) =
                            write_packet(&mut writer, &ControlPacket::PingReq).await
                        {
                            return LoopExit::Lost(err.to_string());
                        }
                        last_write = Instant::now();
                        if pong_deadline.is_none() {
                            pong_deadline = Some(Instant::now() + grace);
                        }
                    }
                }
            }
        }
    }

    /// Write out acknowledgments and unsubscribes queued by the
    /// dispatcher.
    async fn flush_ready_actions(
        &mut self,
        writer: &mut WriteHalf<ByteStream>,
        last_write: &mut Instant,
    ) -> MqttResult<()> {
        let (acks, unsubscribes) = self.dispatcher.take_ready_actions();
        for ack in acks {
            write_packet(writer, &ack).await?;
            *last_write = Instant::now();
            if let ControlPacket::PubRec { packet_id } = ack {
                self.core.lock().unwrap().inbound_qos2.mark_rec_sent(packet_id);
            }
        }
        for filter in unsubscribes {
            let unsubscribe = {
                let mut core = self.core.lock().unwrap();
                match core.packet_ids.acquire() {
                    Ok(packet_id) => {
                        // Discarded waiter: UNSUBACK routing releases the
                        // identifier.
                        let (waiter, _discard) = oneshot::channel();
                        core.register_unsuback_waiter(packet_id, waiter);
                        ControlPacket::Unsubscribe {
                            packet_id,
                            filters: vec![filter],
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "cannot unsubscribe");
                        continue;
                    }
                }
            };
            write_packet(writer, &unsubscribe).await?;
            *last_write = Instant::now();
        }
        Ok(())
    }

    /// Route one inbound frame. Returns whether a frame was written in
    /// response (for keep-alive bookkeeping).
    async fn handle_incoming(
        &mut self,
        packet: ControlPacket,
        writer: &mut WriteHalf<ByteStream>,
        pong_deadline: &mut Option<Instant>,
    ) -> MqttResult<bool> {
        match packet {
            ControlPacket::Publish(publish) => {
                if publish.qos == QoS::ExactlyOnce {
                    let packet_id = publish
                        .packet_id
                        .ok_or_else(|| MqttError::violation("QoS 2 publish without packet id"))?;
                    let disposition = {
                        let mut core = self.core.lock().unwrap();
                        core.inbound_qos2.on_publish(packet_id)
                    };
                    match disposition {
                        InboundDisposition::Deliver => {
                            self.dispatcher.accept(publish);
                        }
                        InboundDisposition::DropDuplicate => {
                            debug!(packet_id, "dropping duplicate QoS 2 publish");
                        }
                        InboundDisposition::ResendPubRec => {
                            // Redelivery after our PUBREC: answer with
                            // PUBREC only, never hand it to the
                            // application again.
                            write_packet(writer, &ControlPacket::PubRec { packet_id }).await?;
                            return Ok(true);
                        }
                    }
                } else {
                    self.dispatcher.accept(publish);
                }
                Ok(false)
            }
            ControlPacket::PubAck { packet_id } => {
                let action = self.core.lock().unwrap().outbound.handle_puback(packet_id)?;
                self.apply_ack_action(action, writer).await
            }
            ControlPacket::PubRec { packet_id } => {
                let action = self.core.lock().unwrap().outbound.handle_pubrec(packet_id)?;
                self.apply_ack_action(action, writer).await
            }
            ControlPacket::PubComp { packet_id } => {
                let action = self.core.lock().unwrap().outbound.handle_pubcomp(packet_id)?;
                self.apply_ack_action(action, writer).await
            }
            ControlPacket::PubRel { packet_id } => {
                let response = self.core.lock().unwrap().inbound_qos2.handle_pubrel(packet_id);
                write_packet(writer, &response).await?;
                Ok(true)
            }
            ControlPacket::SubAck { packet_id, codes } => {
                self.core.lock().unwrap().handle_suback(packet_id, codes)?;
                Ok(false)
            }
            ControlPacket::UnsubAck { packet_id } => {
                self.core.lock().unwrap().handle_unsuback(packet_id)?;
                Ok(false)
            }
            ControlPacket::PingResp => {
                *pong_deadline = None;
                Ok(false)
            }
            ControlPacket::ConnAck { .. } => {
                Err(MqttError::violation("duplicate CONNACK while connected"))
            }
            other => Err(MqttError::violation(format!(
                "unexpected {} from broker",
                other.kind()
            ))),
        }
    }

    async fn apply_ack_action(
        &mut self,
        action: AckAction,
        writer: &mut WriteHalf<ByteStream>,
    ) -> MqttResult<bool> {
        match action {
            AckAction::None => Ok(false),
            AckAction::Completed { packet_id } => {
                self.core.lock().unwrap().packet_ids.release(packet_id);
                Ok(false)
            }
            AckAction::SendPubRel { packet_id } => {
                write_packet(writer, &ControlPacket::PubRel { packet_id }).await?;
                self.core.lock().unwrap().outbound.mark_pubrel_sent(packet_id);
                Ok(true)
            }
        }
    }

    /// Backoff sleep that a disconnect command cuts short. Returns false
    /// when shutdown was requested.
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            command = self.cmd_rx.recv() => {
                match command {
                    Some(Command::Disconnect) | None => false,
                    // Cannot be written while disconnected: fail its waiter
                    // instead of letting it dangle.
                    Some(Command::Send(packet)) => {
                        self.fail_unwritable(packet);
                        true
                    }
                }
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn fail_unwritable(&self, packet: ControlPacket) {
        if let ControlPacket::Subscribe { packet_id, .. }
        | ControlPacket::Unsubscribe { packet_id, .. } = packet
        {
            self.core.lock().unwrap().fail_handshake(packet_id);
        }
    }

    /// Final teardown: fail every waiter, close every flow.
    fn teardown(&mut self, reason: &str) {
        {
            let mut core = self.core.lock().unwrap();
            core.close(reason);
        }
        self.dispatcher.close_all();
        let _ = self.state_tx.send(SessionState::Disconnected);
        let mut health = self.health.lock().unwrap();
        health.connected_at = None;
    }
}

/// Exponential backoff with uniform jitter of up to half the delay.
fn backoff_with_jitter(config: &ClientConfig, attempt: u32) -> Duration {
    let base = config.reconnect.backoff_delay(attempt);
    let jitter_ceiling = base.as_millis() as u64 / 2;
    if jitter_ceiling == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
    base + Duration::from_millis(jitter)
}

/// Read one complete frame, appending transport reads to `buf` until the
/// decoder has enough bytes. Cancel-safe: partial reads stay in `buf`.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> MqttResult<ControlPacket> {
    loop {
        if let Some(packet) = codec::decode(buf).map_err(escalate_decode_error)? {
            return Ok(packet);
        }
        let n = reader
            .read_buf(buf)
            .await
            .map_err(MqttError::Transport)?;
        if n == 0 {
            return Err(MqttError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
    }
}

async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &ControlPacket,
) -> MqttResult<()> {
    let mut buf = BytesMut::with_capacity(128);
    codec::encode(packet, &mut buf)?;
    writer
        .write_all(&buf)
        .await
        .map_err(MqttError::Transport)?;
    Ok(())
}
