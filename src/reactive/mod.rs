//! Reactive bridge
//!
//! Adapts the push-based dispatcher into a cancellable, demand-driven
//! consumer surface, and the publish path into a capacity-aware sink. The
//! backpressure protocol is explicit credit tracking: the consumer calls
//! [`MessageFlow::request`] for N more messages; delivery (and therefore
//! protocol acknowledgment toward the broker) happens only against that
//! demand, so a slow consumer throttles the broker through the receive
//! quota.

use crate::client::ClientInner;
use crate::codec::QoS;
use crate::dispatch::{Dispatcher, FlowShared, Message};
use crate::error::{MqttError, MqttResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Demand-driven stream of messages for one subscription.
///
/// Messages arrive only against explicit demand: call [`request`] before
/// awaiting [`recv`], or use [`next`] which requests one and waits.
/// Dropping (or [`cancel`]ing) the flow detaches it; when it was the
/// filter's last flow the engine unsubscribes at the protocol level and
/// releases any buffered messages.
///
/// [`request`]: MessageFlow::request
/// [`recv`]: MessageFlow::recv
/// [`next`]: MessageFlow::next
/// [`cancel`]: MessageFlow::cancel
pub struct MessageFlow {
    filter: String,
    flow_id: u64,
    shared: Arc<FlowShared>,
    dispatcher: Arc<Dispatcher>,
    cancelled: bool,
}

impl MessageFlow {
    pub(crate) fn new(
        filter: String,
        flow_id: u64,
        shared: Arc<FlowShared>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            filter,
            flow_id,
            shared,
            dispatcher,
            cancelled: false,
        }
    }

    /// The filter this flow listens on.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Signal demand for `n` more messages.
    pub fn request(&self, n: u64) {
        self.dispatcher.grant_credit(self.flow_id, n);
    }

    /// Outstanding demand not yet satisfied by a delivery.
    pub fn requested(&self) -> u64 {
        self.shared.state.lock().unwrap().requested
    }

    /// Take a delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.shared.state.lock().unwrap().buffer.pop_front()
    }

    /// Wait for the next delivered message. Returns `None` once the flow
    /// is closed (cancelled, or the session ended) and the buffer is
    /// drained. Only messages previously requested are ever delivered.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(message) = state.buffer.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Request one message and wait for it.
    pub async fn next(&mut self) -> Option<Message> {
        self.request(1);
        self.recv().await
    }

    /// Detach from the subscription. Equivalent to dropping the flow.
    pub fn cancel(mut self) {
        self.do_cancel();
    }

    fn do_cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.dispatcher
            .cancel_flow(&self.filter, self.flow_id, true);
    }
}

impl Drop for MessageFlow {
    fn drop(&mut self) {
        self.do_cancel();
    }
}

/// Completion signal for a published message.
///
/// Resolves per the QoS contract: QoS 0 on local hand-off, QoS 1 on
/// PUBACK, QoS 2 on PUBCOMP. Dropping it abandons the wait; the frame
/// already on the wire is not retracted and its handshake keeps running.
#[derive(Debug)]
pub struct PublishCompletion {
    packet_id: Option<u16>,
    receiver: Option<oneshot::Receiver<MqttResult<()>>>,
    ack_timeout: Option<Duration>,
}

impl PublishCompletion {
    pub(crate) fn immediate() -> Self {
        Self {
            packet_id: None,
            receiver: None,
            ack_timeout: None,
        }
    }

    pub(crate) fn tracked(
        packet_id: u16,
        receiver: oneshot::Receiver<MqttResult<()>>,
        ack_timeout: Option<Duration>,
    ) -> Self {
        Self {
            packet_id: Some(packet_id),
            receiver: Some(receiver),
            ack_timeout,
        }
    }

    /// The packet identifier driving the handshake, if any.
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// Wait for the broker to confirm receipt. Fails with
    /// [`MqttError::AckTimeout`] when a configured acknowledgment timeout
    /// elapses first.
    pub async fn wait(self) -> MqttResult<()> {
        let receiver = match self.receiver {
            Some(receiver) => receiver,
            None => return Ok(()),
        };
        let packet_id = self.packet_id.unwrap_or_default();
        match self.ack_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(MqttError::closed("session dropped while awaiting ack")),
                Err(_) => Err(MqttError::AckTimeout { packet_id }),
            },
            None => match receiver.await {
                Ok(result) => result,
                Err(_) => Err(MqttError::closed("session dropped while awaiting ack")),
            },
        }
    }
}

/// Backpressure-aware publisher for sequences of outbound messages.
///
/// [`send`] waits for send-queue capacity (derived from the configured
/// outbound bound) instead of rejecting with `Overflow` the way the
/// direct [`crate::MqttClient::publish`] call does, so feeding it from a
/// producer loop naturally paces the producer to the transport.
///
/// [`send`]: PublishSink::send
#[derive(Clone)]
pub struct PublishSink {
    pub(crate) inner: Arc<ClientInner>,
}

impl PublishSink {
    /// Enqueue one message, waiting for queue capacity. The returned
    /// completion resolves per the message's QoS contract.
    pub async fn send(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> MqttResult<PublishCompletion> {
        self.inner
            .publish_enqueue(topic, payload.into(), qos, retain, true)
            .await
    }
}
