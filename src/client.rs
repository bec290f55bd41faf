//! Client surface
//!
//! [`MqttClient`] is the session handle applications hold: connect,
//! subscribe, publish, unsubscribe, disconnect. It is cheap to clone; all
//! clones share one session. The connection supervisor runs as a spawned
//! task and owns the transport; client calls talk to it through channels,
//! keeping the session single-writer for outbound frames.

use crate::codec::{ControlPacket, Publish, QoS, SubAckCode};
use crate::config::ClientConfig;
use crate::connection::{
    health_snapshot, Command, Connector, HealthSnapshot, HealthState, Supervisor, TcpConnector,
};
use crate::dispatch::{validate_topic_name, Dispatcher, TopicFilter};
use crate::error::{MqttError, MqttResult};
use crate::reactive::{MessageFlow, PublishCompletion, PublishSink};
use crate::session::{SessionCore, SessionState};
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub(crate) struct ClientInner {
    config: ClientConfig,
    core: Arc<StdMutex<SessionCore>>,
    dispatcher: Arc<Dispatcher>,
    data_tx: mpsc::Sender<Publish>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    health: Arc<StdMutex<HealthState>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to one MQTT session
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    /// Connect to the broker named by the configuration over plain TCP.
    /// Resolves once CONNACK is accepted; a rejected or timed-out connect
    /// fails here and the session never starts.
    pub async fn connect(config: ClientConfig) -> MqttResult<Self> {
        config.validate()?;
        let endpoint = config.broker_endpoint()?;
        let connector = TcpConnector::new(endpoint).map_err(MqttError::Transport)?;
        Self::connect_with(config, Box::new(connector)).await
    }

    /// Connect through a caller-supplied transport dialer. This is the
    /// seam for TLS (`mqtts://`) and for in-process test brokers.
    pub async fn connect_with(
        config: ClientConfig,
        connector: Box<dyn Connector>,
    ) -> MqttResult<Self> {
        config.validate()?;
        let client_id = config.resolve_client_id();
        info!(client_id = %client_id, broker = %config.broker_url, "connecting");

        let core = Arc::new(StdMutex::new(SessionCore::new()));
        let dispatcher = Arc::new(Dispatcher::new(config.receive_maximum));
        let health = Arc::new(StdMutex::new(HealthState::default()));
        let (data_tx, data_rx) = mpsc::channel(config.max_pending_outbound);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (gate_tx, gate_rx) = oneshot::channel();

        let supervisor = Supervisor {
            config: config.clone(),
            client_id,
            connector,
            core: Arc::clone(&core),
            dispatcher: Arc::clone(&dispatcher),
            data_rx,
            cmd_rx,
            state_tx,
            health: Arc::clone(&health),
            connect_gate: Some(gate_tx),
        };
        let handle = tokio::spawn(supervisor.run());

        let connected = gate_rx
            .await
            .unwrap_or_else(|_| Err(MqttError::closed("connection supervisor stopped")));
        if let Err(err) = connected {
            handle.abort();
            return Err(err);
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                core,
                dispatcher,
                data_tx,
                cmd_tx,
                state_rx,
                health,
                supervisor: StdMutex::new(Some(handle)),
            }),
        })
    }

    /// Current protocol-level session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Watch session state changes (reconnects, disconnects).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Connection health: uptime, inbound recency, reconnect count.
    pub fn health(&self) -> HealthSnapshot {
        health_snapshot(&self.inner.health)
    }

    /// Subscribe to a topic filter and receive its messages as a
    /// demand-driven [`MessageFlow`]. Waits for the broker's SUBACK; a
    /// failure return code fails the call.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<MessageFlow> {
        self.inner.check_connected()?;
        let parsed = TopicFilter::parse(filter)?;
        let registration = self.inner.dispatcher.register_flow(parsed, qos);
        let flow = MessageFlow::new(
            filter.to_string(),
            registration.flow_id,
            registration.shared,
            Arc::clone(&self.inner.dispatcher),
        );

        if !registration.needs_subscribe {
            // Another flow already holds the broker-side subscription.
            return Ok(flow);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let (subscribe, packet_id) = {
            let mut core = self.inner.core.lock().unwrap();
            if let Some(reason) = core.closed_reason() {
                return Err(MqttError::closed(reason));
            }
            let packet_id = core.packet_ids.acquire()?;
            core.register_suback_waiter(packet_id, waiter_tx);
            (
                ControlPacket::Subscribe {
                    packet_id,
                    filters: vec![(filter.to_string(), registration.effective_qos)],
                },
                packet_id,
            )
        };
        if self.inner.cmd_tx.send(Command::Send(subscribe)).is_err() {
            self.inner.core.lock().unwrap().fail_handshake(packet_id);
            return Err(MqttError::closed("connection supervisor stopped"));
        }

        let codes = waiter_rx
            .await
            .unwrap_or_else(|_| Err(MqttError::closed("session dropped while subscribing")))?;

        match codes.first() {
            Some(code) if !code.is_failure() => {
                let granted = match code {
                    SubAckCode::GrantedQoS0 => QoS::AtMostOnce,
                    SubAckCode::GrantedQoS1 => QoS::AtLeastOnce,
                    SubAckCode::GrantedQoS2 => QoS::ExactlyOnce,
                    SubAckCode::Failure => unreachable!(),
                };
                self.inner.dispatcher.confirm_subscription(filter, granted);
                Ok(flow)
            }
            _ => {
                warn!(filter, "broker rejected subscription");
                // Detach quietly: the broker holds no subscription for us.
                flow.cancel();
                Err(MqttError::SubscriptionRejected {
                    filter: filter.to_string(),
                })
            }
        }
    }

    /// Publish a message. Completion follows the QoS contract: QoS 0
    /// returns after hand-off to the writer queue, QoS 1 after PUBACK,
    /// QoS 2 after PUBCOMP. A full outbound queue fails immediately with
    /// [`MqttError::Overflow`]; use [`MqttClient::publish_sink`] to wait
    /// for capacity instead.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> MqttResult<()> {
        self.publish_with(topic, payload, qos, false).await
    }

    /// [`publish`](MqttClient::publish) with control over the retain flag.
    pub async fn publish_with(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> MqttResult<()> {
        let completion = self
            .inner
            .publish_enqueue(topic, payload.into(), qos, retain, false)
            .await?;
        completion.wait().await
    }

    /// A backpressure-aware sink for publishing message sequences.
    pub fn publish_sink(&self) -> PublishSink {
        PublishSink {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Drop the broker-side subscription for a filter and close every flow
    /// attached to it. Waits for UNSUBACK.
    pub async fn unsubscribe(&self, filter: &str) -> MqttResult<()> {
        self.inner.check_connected()?;
        if !self.inner.dispatcher.cancel_filter(filter) {
            return Ok(());
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let (unsubscribe, packet_id) = {
            let mut core = self.inner.core.lock().unwrap();
            let packet_id = core.packet_ids.acquire()?;
            core.register_unsuback_waiter(packet_id, waiter_tx);
            (
                ControlPacket::Unsubscribe {
                    packet_id,
                    filters: vec![filter.to_string()],
                },
                packet_id,
            )
        };
        if self.inner.cmd_tx.send(Command::Send(unsubscribe)).is_err() {
            self.inner.core.lock().unwrap().fail_handshake(packet_id);
            return Err(MqttError::closed("connection supervisor stopped"));
        }
        waiter_rx
            .await
            .unwrap_or_else(|_| Err(MqttError::closed("session dropped while unsubscribing")))
    }

    /// Gracefully end the session: DISCONNECT packet, transport close,
    /// supervisor shutdown. Pending operations fail with `SessionClosed`.
    pub async fn disconnect(&self) -> MqttResult<()> {
        let _ = self.inner.cmd_tx.send(Command::Disconnect);
        let handle = self.inner.supervisor.lock().unwrap().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(std::time::Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => info!("session shut down"),
                Ok(Err(join_err)) if !join_err.is_cancelled() => {
                    warn!(error = %join_err, "supervisor ended with error");
                }
                Err(_) => {
                    warn!("supervisor did not stop in time; aborting");
                    handle.abort();
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl ClientInner {
    fn check_connected(&self) -> MqttResult<()> {
        let state = *self.state_rx.borrow();
        if state != SessionState::Connected {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Shared publish path. `wait_for_capacity` selects between the
    /// sink's awaiting behavior and the direct call's Overflow rejection.
    pub(crate) async fn publish_enqueue(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        wait_for_capacity: bool,
    ) -> MqttResult<PublishCompletion> {
        validate_topic_name(topic)?;
        self.check_connected()?;

        if qos == QoS::AtMostOnce {
            let publish = Publish {
                dup: false,
                qos,
                retain,
                topic: topic.to_string(),
                packet_id: None,
                payload,
            };
            self.enqueue(publish, wait_for_capacity).await?;
            return Ok(PublishCompletion::immediate());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let publish = {
            let mut core = self.core.lock().unwrap();
            if let Some(reason) = core.closed_reason() {
                return Err(MqttError::closed(reason));
            }
            let packet_id = core.packet_ids.acquire()?;
            let publish = Publish {
                dup: false,
                qos,
                retain,
                topic: topic.to_string(),
                packet_id: Some(packet_id),
                payload,
            };
            core.outbound.register(publish.clone(), done_tx)?;
            publish
        };
        let packet_id = publish.packet_id.expect("tracked publish has id");

        if let Err(err) = self.enqueue(publish, wait_for_capacity).await {
            // Roll the registration back; the frame never left.
            let mut core = self.core.lock().unwrap();
            if core.outbound.remove_unwritten(packet_id) {
                core.packet_ids.release(packet_id);
            }
            return Err(err);
        }

        Ok(PublishCompletion::tracked(
            packet_id,
            done_rx,
            self.config.ack_timeout(),
        ))
    }

    async fn enqueue(&self, publish: Publish, wait_for_capacity: bool) -> MqttResult<()> {
        if wait_for_capacity {
            self.data_tx
                .send(publish)
                .await
                .map_err(|_| MqttError::closed("connection supervisor stopped"))
        } else {
            match self.data_tx.try_send(publish) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(MqttError::Overflow {
                    bound: self.config.max_pending_outbound,
                }),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(MqttError::closed("connection supervisor stopped"))
                }
            }
        }
    }
}
