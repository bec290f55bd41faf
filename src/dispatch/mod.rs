//! Flow-controlled dispatcher
//!
//! Matches inbound publishes against registered subscriptions, fans a
//! message out once per matching subscription flow, and gates protocol
//! acknowledgment on actual downstream delivery: an inbound QoS>0 message
//! is acknowledged only once every matching flow with demand has taken it.
//! With the receive quota exhausted, further inbound QoS>0 messages are
//! held unacknowledged, which pauses the broker.
//!
//! The dispatcher never touches the transport itself. Acknowledgments and
//! unsubscribes it decides on are queued as ready actions; the connection
//! event loop is woken through a [`Notify`] and drains them onto the wire.

mod filter;

pub use filter::{validate_topic_name, TopicFilter};

use crate::codec::{ControlPacket, Publish, QoS};
use crate::session::ReceiveQuota;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A message delivered to a subscription flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl Message {
    fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        }
    }
}

/// Consumer-side state shared between the dispatcher and a flow
#[derive(Debug)]
pub(crate) struct FlowShared {
    pub(crate) state: Mutex<FlowState>,
    pub(crate) notify: Notify,
}

#[derive(Debug)]
pub(crate) struct FlowState {
    /// Outstanding demand: how many more messages the consumer asked for
    pub(crate) requested: u64,
    pub(crate) buffer: VecDeque<Message>,
    pub(crate) closed: bool,
}

impl FlowShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FlowState {
                requested: 0,
                buffer: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }
}

struct FlowEntry {
    id: u64,
    shared: Arc<FlowShared>,
}

struct Subscription {
    filter: TopicFilter,
    qos: QoS,
    flows: Vec<FlowEntry>,
}

/// An inbound publish not yet acknowledged: one or more matching flows
/// still lack demand for it.
struct PendingInbound {
    publish: Publish,
    remaining: Vec<u64>,
    acquired_quota: bool,
}

struct DispatcherInner {
    quota: ReceiveQuota,
    subscriptions: Vec<Subscription>,
    pending: VecDeque<PendingInbound>,
    ready_acks: VecDeque<ControlPacket>,
    ready_unsubscribes: Vec<String>,
    next_flow_id: u64,
    qos0_pending_limit: usize,
}

/// Outcome of registering a flow for a filter
pub(crate) struct FlowRegistration {
    pub(crate) flow_id: u64,
    pub(crate) shared: Arc<FlowShared>,
    /// A SUBSCRIBE must go to the broker (new filter, or QoS upgrade)
    pub(crate) needs_subscribe: bool,
    pub(crate) effective_qos: QoS,
}

pub struct Dispatcher {
    inner: Mutex<DispatcherInner>,
    /// Wakes the connection loop when ready actions are queued
    pub(crate) actions_ready: Notify,
}

impl Dispatcher {
    pub fn new(receive_maximum: u16) -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                quota: ReceiveQuota::new(receive_maximum),
                subscriptions: Vec::new(),
                pending: VecDeque::new(),
                ready_acks: VecDeque::new(),
                ready_unsubscribes: Vec::new(),
                next_flow_id: 1,
                qos0_pending_limit: receive_maximum as usize,
            }),
            actions_ready: Notify::new(),
        }
    }

    /// Register a consumer flow for a filter. A subscription is unique per
    /// filter; additional flows attach to the existing one.
    pub(crate) fn register_flow(&self, filter: TopicFilter, qos: QoS) -> FlowRegistration {
        let mut inner = self.inner.lock().unwrap();
        let flow_id = inner.next_flow_id;
        inner.next_flow_id += 1;
        let shared = FlowShared::new();

        if let Some(subscription) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.filter.as_str() == filter.as_str())
        {
            let needs_subscribe = qos > subscription.qos;
            if needs_subscribe {
                subscription.qos = qos;
            }
            let effective_qos = subscription.qos;
            subscription.flows.push(FlowEntry {
                id: flow_id,
                shared: Arc::clone(&shared),
            });
            FlowRegistration {
                flow_id,
                shared,
                needs_subscribe,
                effective_qos,
            }
        } else {
            inner.subscriptions.push(Subscription {
                filter,
                qos,
                flows: vec![FlowEntry {
                    id: flow_id,
                    shared: Arc::clone(&shared),
                }],
            });
            FlowRegistration {
                flow_id,
                shared,
                needs_subscribe: true,
                effective_qos: qos,
            }
        }
    }

    /// Detach a flow. When it was the subscription's last flow the filter
    /// is unregistered and an UNSUBSCRIBE is queued for the broker
    /// (`with_unsubscribe`). Buffered messages are released.
    pub(crate) fn cancel_flow(&self, filter: &str, flow_id: u64, with_unsubscribe: bool) {
        let mut inner = self.inner.lock().unwrap();

        let mut removed_subscription = false;
        if let Some(index) = inner
            .subscriptions
            .iter()
            .position(|s| s.filter.as_str() == filter)
        {
            let subscription = &mut inner.subscriptions[index];
            if let Some(flow_index) = subscription.flows.iter().position(|f| f.id == flow_id) {
                let entry = subscription.flows.remove(flow_index);
                let mut state = entry.shared.state.lock().unwrap();
                state.closed = true;
                state.buffer.clear();
                entry.shared.notify.notify_waiters();
            }
            if subscription.flows.is_empty() {
                inner.subscriptions.remove(index);
                removed_subscription = true;
            }
        }

        // A message waiting on this flow may now be fully delivered.
        Self::purge_flow_from_pending(&mut inner, flow_id);
        Self::pump(&mut inner);

        if removed_subscription && with_unsubscribe {
            inner.ready_unsubscribes.push(filter.to_string());
        }
        drop(inner);
        self.actions_ready.notify_one();
    }

    /// Remove a whole filter: close its flows and unregister it. Used by
    /// the explicit unsubscribe operation, which sends UNSUBSCRIBE itself.
    pub(crate) fn cancel_filter(&self, filter: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner
            .subscriptions
            .iter()
            .position(|s| s.filter.as_str() == filter)
        {
            Some(index) => index,
            None => return false,
        };
        let subscription = inner.subscriptions.remove(index);
        let flow_ids: Vec<u64> = subscription.flows.iter().map(|f| f.id).collect();
        for entry in &subscription.flows {
            let mut state = entry.shared.state.lock().unwrap();
            state.closed = true;
            state.buffer.clear();
            entry.shared.notify.notify_waiters();
        }
        for flow_id in flow_ids {
            Self::purge_flow_from_pending(&mut inner, flow_id);
        }
        Self::pump(&mut inner);
        drop(inner);
        self.actions_ready.notify_one();
        true
    }

    /// Record the broker-granted QoS for a filter after SUBACK.
    pub(crate) fn confirm_subscription(&self, filter: &str, granted: QoS) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscription) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.filter.as_str() == filter)
        {
            subscription.qos = granted;
        }
    }

    /// Add consumer demand to a flow and drain whatever it unblocks.
    pub(crate) fn grant_credit(&self, flow_id: u64, n: u64) {
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut found = false;
        for subscription in &inner.subscriptions {
            if let Some(entry) = subscription.flows.iter().find(|f| f.id == flow_id) {
                let mut state = entry.shared.state.lock().unwrap();
                state.requested = state.requested.saturating_add(n);
                found = true;
                break;
            }
        }
        if !found {
            return;
        }
        Self::pump(&mut inner);
        drop(inner);
        self.actions_ready.notify_one();
    }

    /// Route an inbound publish. Returns false when no subscription
    /// matches (the message is dropped, though QoS>0 copies are still
    /// acknowledged so the broker does not retry forever).
    pub fn accept(&self, publish: Publish) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let mut matched: Vec<u64> = Vec::new();
        for subscription in &inner.subscriptions {
            if subscription.filter.matches(&publish.topic) {
                matched.extend(subscription.flows.iter().map(|f| f.id));
            }
        }

        if matched.is_empty() {
            debug!(topic = %publish.topic, "inbound publish matched no subscription");
            if let Some(ack) = immediate_ack(&publish) {
                inner.ready_acks.push_back(ack);
                drop(inner);
                self.actions_ready.notify_one();
            }
            return false;
        }

        let acquired_quota = publish.qos != QoS::AtMostOnce && inner.quota.try_acquire();
        inner.pending.push_back(PendingInbound {
            publish,
            remaining: matched,
            acquired_quota,
        });
        Self::enforce_qos0_bound(&mut inner);
        Self::pump(&mut inner);
        drop(inner);
        self.actions_ready.notify_one();
        true
    }

    /// Drain queued protocol actions: acknowledgments to write and filters
    /// to unsubscribe.
    pub(crate) fn take_ready_actions(&self) -> (Vec<ControlPacket>, Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        (
            inner.ready_acks.drain(..).collect(),
            std::mem::take(&mut inner.ready_unsubscribes),
        )
    }

    /// Forget queued actions that cannot outlive a non-resumed session.
    pub(crate) fn clear_ready_acks(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready_acks.clear();
    }

    /// All filters to re-establish after a reconnect.
    pub(crate) fn resubscribe_filters(&self) -> Vec<(String, QoS)> {
        let inner = self.inner.lock().unwrap();
        inner
            .subscriptions
            .iter()
            .map(|s| (s.filter.as_str().to_string(), s.qos))
            .collect()
    }

    /// Close every flow; consumers see end-of-stream.
    pub(crate) fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for subscription in &inner.subscriptions {
            for entry in &subscription.flows {
                let mut state = entry.shared.state.lock().unwrap();
                state.closed = true;
                entry.shared.notify.notify_waiters();
            }
        }
        inner.subscriptions.clear();
        inner.pending.clear();
    }

    pub fn quota_available(&self) -> u16 {
        self.inner.lock().unwrap().quota.available()
    }

    pub(crate) fn pending_unacked(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Deliver pending messages in arrival order. Strict FIFO: the head
    /// blocks everything behind it until every matching flow has taken it,
    /// preserving per-subscription ordering.
    fn pump(inner: &mut DispatcherInner) {
        loop {
            let DispatcherInner {
                quota,
                subscriptions,
                pending,
                ready_acks,
                ..
            } = inner;

            let head = match pending.front_mut() {
                Some(head) => head,
                None => break,
            };

            let message = Message::from_publish(&head.publish);
            head.remaining.retain(|flow_id| {
                let entry = subscriptions
                    .iter()
                    .flat_map(|s| s.flows.iter())
                    .find(|f| f.id == *flow_id);
                let entry = match entry {
                    Some(entry) => entry,
                    // Flow cancelled while the message waited.
                    None => return false,
                };
                let mut state = entry.shared.state.lock().unwrap();
                if state.closed {
                    return false;
                }
                if state.requested == 0 {
                    return true;
                }
                state.requested -= 1;
                state.buffer.push_back(message.clone());
                entry.shared.notify.notify_one();
                false
            });

            if !head.remaining.is_empty() {
                break;
            }

            let head = pending.pop_front().expect("head exists");
            if let Some(ack) = immediate_ack(&head.publish) {
                ready_acks.push_back(ack);
            }
            if head.acquired_quota {
                quota.release();
            }
        }
    }

    fn purge_flow_from_pending(inner: &mut DispatcherInner, flow_id: u64) {
        for entry in inner.pending.iter_mut() {
            entry.remaining.retain(|id| *id != flow_id);
        }
    }

    /// QoS 0 has no protocol pause lever, so parked QoS 0 messages are
    /// bounded: beyond the limit the oldest one is dropped.
    fn enforce_qos0_bound(inner: &mut DispatcherInner) {
        let limit = inner.qos0_pending_limit;
        let qos0_count = inner
            .pending
            .iter()
            .filter(|p| p.publish.qos == QoS::AtMostOnce)
            .count();
        if qos0_count <= limit {
            return;
        }
        if let Some(index) = inner
            .pending
            .iter()
            .position(|p| p.publish.qos == QoS::AtMostOnce)
        {
            let dropped = inner.pending.remove(index).expect("index valid");
            warn!(topic = %dropped.publish.topic, "dropping oldest undelivered QoS 0 message");
        }
    }
}

/// The acknowledgment owed for an inbound publish once delivered.
fn immediate_ack(publish: &Publish) -> Option<ControlPacket> {
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => None,
        (QoS::AtLeastOnce, Some(packet_id)) => Some(ControlPacket::PubAck { packet_id }),
        (QoS::ExactlyOnce, Some(packet_id)) => Some(ControlPacket::PubRec { packet_id }),
        // Decoder guarantees a packet id for QoS>0.
        (_, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(topic: &str, qos: QoS, packet_id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::from_static(b"payload"),
        }
    }

    fn take_one(shared: &Arc<FlowShared>) -> Option<Message> {
        shared.state.lock().unwrap().buffer.pop_front()
    }

    #[test]
    fn test_wildcard_delivery() {
        let dispatcher = Dispatcher::new(16);
        let registration =
            dispatcher.register_flow(TopicFilter::parse("a/+/c").unwrap(), QoS::AtMostOnce);
        dispatcher.grant_credit(registration.flow_id, 10);

        assert!(dispatcher.accept(inbound("a/b/c", QoS::AtMostOnce, None)));
        assert!(!dispatcher.accept(inbound("a/b/b/c", QoS::AtMostOnce, None)));

        let message = take_one(&registration.shared).expect("delivered");
        assert_eq!(message.topic, "a/b/c");
        assert!(take_one(&registration.shared).is_none());
    }

    #[test]
    fn test_fanout_once_per_matching_subscription() {
        let dispatcher = Dispatcher::new(16);
        let first =
            dispatcher.register_flow(TopicFilter::parse("a/#").unwrap(), QoS::AtMostOnce);
        let second =
            dispatcher.register_flow(TopicFilter::parse("a/+").unwrap(), QoS::AtMostOnce);
        dispatcher.grant_credit(first.flow_id, 1);
        dispatcher.grant_credit(second.flow_id, 1);

        dispatcher.accept(inbound("a/b", QoS::AtMostOnce, None));

        assert!(take_one(&first.shared).is_some());
        assert!(take_one(&second.shared).is_some());
    }

    #[test]
    fn test_ack_follows_delivery_not_receipt() {
        let dispatcher = Dispatcher::new(16);
        let registration =
            dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);

        // No demand yet: message parks unacknowledged.
        dispatcher.accept(inbound("t", QoS::AtLeastOnce, Some(1)));
        let (acks, _) = dispatcher.take_ready_actions();
        assert!(acks.is_empty());
        assert_eq!(dispatcher.pending_unacked(), 1);

        // Demand arrives: delivery happens and the PUBACK is queued.
        dispatcher.grant_credit(registration.flow_id, 1);
        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(acks, vec![ControlPacket::PubAck { packet_id: 1 }]);
        assert!(take_one(&registration.shared).is_some());
    }

    #[test]
    fn test_requested_two_of_five() {
        // The delivery contract scenario: five QoS 1 messages arrive but
        // the consumer asked for two; only those two are acknowledged.
        let dispatcher = Dispatcher::new(16);
        let registration =
            dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);
        dispatcher.grant_credit(registration.flow_id, 2);

        for packet_id in 1..=5u16 {
            dispatcher.accept(inbound("t", QoS::AtLeastOnce, Some(packet_id)));
        }

        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(
            acks,
            vec![
                ControlPacket::PubAck { packet_id: 1 },
                ControlPacket::PubAck { packet_id: 2 },
            ]
        );
        assert_eq!(dispatcher.pending_unacked(), 3);
        assert_eq!(dispatcher.quota_available(), 16 - 3);

        // More demand releases the rest in order.
        dispatcher.grant_credit(registration.flow_id, 3);
        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(acks.len(), 3);
        assert_eq!(dispatcher.quota_available(), 16);
    }

    #[test]
    fn test_quota_never_negative_under_overrun() {
        let dispatcher = Dispatcher::new(2);
        let _registration =
            dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);

        // Broker overruns the receive maximum; quota floors at zero.
        for packet_id in 1..=4u16 {
            dispatcher.accept(inbound("t", QoS::AtLeastOnce, Some(packet_id)));
        }
        assert_eq!(dispatcher.quota_available(), 0);
        assert_eq!(dispatcher.pending_unacked(), 4);
    }

    #[test]
    fn test_unmatched_qos1_still_acked() {
        let dispatcher = Dispatcher::new(16);
        assert!(!dispatcher.accept(inbound("nobody/home", QoS::AtLeastOnce, Some(9))));
        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(acks, vec![ControlPacket::PubAck { packet_id: 9 }]);
    }

    #[test]
    fn test_qos2_ack_is_pubrec() {
        let dispatcher = Dispatcher::new(16);
        let registration =
            dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::ExactlyOnce);
        dispatcher.grant_credit(registration.flow_id, 1);

        dispatcher.accept(inbound("t", QoS::ExactlyOnce, Some(3)));
        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(acks, vec![ControlPacket::PubRec { packet_id: 3 }]);
    }

    #[test]
    fn test_cancel_last_flow_queues_unsubscribe() {
        let dispatcher = Dispatcher::new(16);
        let first = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtMostOnce);
        let second = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtMostOnce);

        dispatcher.cancel_flow("t", first.flow_id, true);
        let (_, unsubscribes) = dispatcher.take_ready_actions();
        assert!(unsubscribes.is_empty(), "another flow still listens");

        dispatcher.cancel_flow("t", second.flow_id, true);
        let (_, unsubscribes) = dispatcher.take_ready_actions();
        assert_eq!(unsubscribes, vec!["t".to_string()]);
    }

    #[test]
    fn test_cancel_unblocks_pending_for_other_flows() {
        let dispatcher = Dispatcher::new(16);
        let stuck = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);
        let eager = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);
        dispatcher.grant_credit(eager.flow_id, 5);

        dispatcher.accept(inbound("t", QoS::AtLeastOnce, Some(1)));
        // Head delivered to the eager flow but still waiting on the stuck
        // one, so no ack yet.
        let (acks, _) = dispatcher.take_ready_actions();
        assert!(acks.is_empty());
        assert!(take_one(&eager.shared).is_some());

        // Cancelling the stuck flow completes delivery and releases the ack.
        dispatcher.cancel_flow("t", stuck.flow_id, true);
        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(acks, vec![ControlPacket::PubAck { packet_id: 1 }]);
    }

    #[test]
    fn test_second_flow_attaches_without_new_subscribe() {
        let dispatcher = Dispatcher::new(16);
        let first = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);
        assert!(first.needs_subscribe);

        let second = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtMostOnce);
        assert!(!second.needs_subscribe);

        // A QoS upgrade re-subscribes.
        let third = dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::ExactlyOnce);
        assert!(third.needs_subscribe);
        assert_eq!(third.effective_qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_qos0_pending_is_bounded() {
        let dispatcher = Dispatcher::new(2);
        let _registration =
            dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtMostOnce);

        for _ in 0..5 {
            dispatcher.accept(inbound("t", QoS::AtMostOnce, None));
        }
        // Limit is receive_maximum (2): the rest were dropped oldest-first.
        assert_eq!(dispatcher.pending_unacked(), 2);
    }

    #[test]
    fn test_strict_fifo_per_flow() {
        let dispatcher = Dispatcher::new(16);
        let registration =
            dispatcher.register_flow(TopicFilter::parse("t").unwrap(), QoS::AtLeastOnce);

        dispatcher.accept(inbound("t", QoS::AtLeastOnce, Some(1)));
        dispatcher.accept(inbound("t", QoS::AtLeastOnce, Some(2)));
        dispatcher.grant_credit(registration.flow_id, 2);

        let first = take_one(&registration.shared).unwrap();
        let second = take_one(&registration.shared).unwrap();
        assert_eq!(first.qos, QoS::AtLeastOnce);
        let (acks, _) = dispatcher.take_ready_actions();
        assert_eq!(
            acks,
            vec![
                ControlPacket::PubAck { packet_id: 1 },
                ControlPacket::PubAck { packet_id: 2 },
            ]
        );
        assert_eq!(first.topic, "t");
        assert_eq!(second.topic, "t");
    }
}
