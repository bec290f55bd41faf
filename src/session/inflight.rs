//! In-flight message tracking for QoS 1/2 acknowledgment handshakes
//!
//! Outbound: QoS 1 publishes wait for PUBACK, QoS 2 publishes walk the
//! PUBREC/PUBREL/PUBCOMP handshake. Duplicate acknowledgments for an
//! already-completed packet identifier are ignored; out-of-order
//! acknowledgments are protocol violations. On reconnect with session
//! resumption, unacknowledged outbound messages are replayed with the
//! duplicate flag set.
//!
//! Inbound: QoS 2 publishes are recorded so a redelivered duplicate is
//! answered with PUBREC only and never handed to the application twice.

use crate::codec::{ControlPacket, Publish, QoS};
use crate::error::{MqttError, MqttResult};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;
use tracing::debug;

/// Delivery state of an outbound QoS>0 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Written to the transport, no acknowledgment yet (QoS 2)
    Sent,
    /// Written to the transport, awaiting PUBACK (QoS 1)
    PubAckPending,
    /// PUBREC received, PUBREL not yet written
    PubRecReceived,
    /// PUBREL written, awaiting PUBCOMP
    PubCompPending,
    /// Handshake finished
    Complete,
}

/// An outbound publish whose acknowledgment handshake is open
#[derive(Debug)]
pub struct OutboundInFlight {
    pub publish: Publish,
    pub state: DeliveryState,
    /// Set once the frame actually went out on the wire. Only written
    /// messages are replayed on session resumption; unwritten ones are
    /// still queued and will be sent normally.
    pub written: bool,
    done: Option<oneshot::Sender<MqttResult<()>>>,
}

/// What the connection loop must do after an acknowledgment was processed
#[derive(Debug, PartialEq, Eq)]
pub enum AckAction {
    /// Nothing to send; duplicate or unknown acknowledgment was ignored
    None,
    /// Handshake complete; release this packet identifier
    Completed { packet_id: u16 },
    /// Send PUBREL for this packet identifier
    SendPubRel { packet_id: u16 },
}

/// Table of outbound in-flight messages, keyed by packet identifier.
/// BTreeMap keeps replay in identifier order, which matches send order
/// for a single session.
#[derive(Debug, Default)]
pub struct OutboundTable {
    entries: BTreeMap<u16, OutboundInFlight>,
}

impl OutboundTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a QoS>0 publish before it is handed to the writer.
    ///
    /// Invariant: at most one in-flight message per packet identifier.
    pub fn register(
        &mut self,
        publish: Publish,
        done: oneshot::Sender<MqttResult<()>>,
    ) -> MqttResult<()> {
        let packet_id = publish
            .packet_id
            .ok_or_else(|| MqttError::violation("QoS>0 publish without packet identifier"))?;
        let state = match publish.qos {
            QoS::AtLeastOnce => DeliveryState::PubAckPending,
            QoS::ExactlyOnce => DeliveryState::Sent,
            QoS::AtMostOnce => {
                return Err(MqttError::violation("QoS 0 publish cannot be tracked"));
            }
        };
        if self.entries.contains_key(&packet_id) {
            return Err(MqttError::violation(format!(
                "packet identifier {packet_id} already in flight"
            )));
        }
        self.entries.insert(
            packet_id,
            OutboundInFlight {
                publish,
                state,
                written: false,
                done: Some(done),
            },
        );
        Ok(())
    }

    /// The writer marks the frame as on-the-wire.
    pub fn mark_written(&mut self, packet_id: u16) {
        if let Some(entry) = self.entries.get_mut(&packet_id) {
            entry.written = true;
        }
    }

    pub fn handle_puback(&mut self, packet_id: u16) -> MqttResult<AckAction> {
        let entry = match self.entries.get_mut(&packet_id) {
            Some(entry) => entry,
            None => {
                debug!(packet_id, "ignoring PUBACK for unknown packet identifier");
                return Ok(AckAction::None);
            }
        };
        if entry.publish.qos != QoS::AtLeastOnce {
            return Err(MqttError::violation(format!(
                "PUBACK for QoS 2 publish {packet_id}"
            )));
        }
        let mut entry = self.entries.remove(&packet_id).expect("entry exists");
        entry.state = DeliveryState::Complete;
        if let Some(done) = entry.done.take() {
            let _ = done.send(Ok(()));
        }
        Ok(AckAction::Completed { packet_id })
    }

    pub fn handle_pubrec(&mut self, packet_id: u16) -> MqttResult<AckAction> {
        let entry = match self.entries.get_mut(&packet_id) {
            Some(entry) => entry,
            None => {
                debug!(packet_id, "ignoring PUBREC for unknown packet identifier");
                return Ok(AckAction::None);
            }
        };
        if entry.publish.qos != QoS::ExactlyOnce {
            return Err(MqttError::violation(format!(
                "PUBREC for QoS 1 publish {packet_id}"
            )));
        }
        match entry.state {
            DeliveryState::Sent => {
                entry.state = DeliveryState::PubRecReceived;
                Ok(AckAction::SendPubRel { packet_id })
            }
            // Broker re-sent PUBREC: our PUBREL was lost, send it again.
            DeliveryState::PubRecReceived | DeliveryState::PubCompPending => {
                Ok(AckAction::SendPubRel { packet_id })
            }
            DeliveryState::PubAckPending | DeliveryState::Complete => {
                Err(MqttError::violation(format!(
                    "PUBREC in state {:?} for packet {packet_id}",
                    entry.state
                )))
            }
        }
    }

    /// The writer marks PUBREL as on-the-wire.
    pub fn mark_pubrel_sent(&mut self, packet_id: u16) {
        if let Some(entry) = self.entries.get_mut(&packet_id) {
            if entry.state == DeliveryState::PubRecReceived {
                entry.state = DeliveryState::PubCompPending;
            }
        }
    }

    pub fn handle_pubcomp(&mut self, packet_id: u16) -> MqttResult<AckAction> {
        let entry = match self.entries.get_mut(&packet_id) {
            Some(entry) => entry,
            None => {
                debug!(packet_id, "ignoring PUBCOMP for unknown packet identifier");
                return Ok(AckAction::None);
            }
        };
        if entry.publish.qos != QoS::ExactlyOnce {
            return Err(MqttError::violation(format!(
                "PUBCOMP for QoS 1 publish {packet_id}"
            )));
        }
        match entry.state {
            // PUBCOMP before PUBREC: the broker skipped half the handshake.
            DeliveryState::Sent => Err(MqttError::violation(format!(
                "PUBCOMP before PUBREC for packet {packet_id}"
            ))),
            DeliveryState::PubRecReceived | DeliveryState::PubCompPending => {
                let mut entry = self.entries.remove(&packet_id).expect("entry exists");
                entry.state = DeliveryState::Complete;
                if let Some(done) = entry.done.take() {
                    let _ = done.send(Ok(()));
                }
                Ok(AckAction::Completed { packet_id })
            }
            DeliveryState::PubAckPending | DeliveryState::Complete => {
                Err(MqttError::violation(format!(
                    "PUBCOMP in state {:?} for packet {packet_id}",
                    entry.state
                )))
            }
        }
    }

    /// Frames to re-send on session resumption: unacknowledged publishes
    /// with the duplicate flag, and PUBREL for handshakes past PUBREC.
    /// Only messages that were actually written before the drop qualify.
    pub fn replay_frames(&mut self) -> Vec<ControlPacket> {
        let mut frames = Vec::new();
        for entry in self.entries.values_mut() {
            if !entry.written {
                continue;
            }
            match entry.state {
                DeliveryState::Sent | DeliveryState::PubAckPending => {
                    let mut publish = entry.publish.clone();
                    publish.dup = true;
                    frames.push(ControlPacket::Publish(publish));
                }
                DeliveryState::PubRecReceived | DeliveryState::PubCompPending => {
                    frames.push(ControlPacket::PubRel {
                        packet_id: entry.publish.packet_id.expect("tracked publish has id"),
                    });
                }
                DeliveryState::Complete => {}
            }
        }
        frames
    }

    /// Drop tracking for a publish whose frame never reached the writer.
    pub fn remove_unwritten(&mut self, packet_id: u16) -> bool {
        match self.entries.get(&packet_id) {
            Some(entry) if !entry.written => {
                self.entries.remove(&packet_id);
                true
            }
            _ => false,
        }
    }

    /// Fail every open handshake, surfacing `reason` to each waiter.
    /// Returns the packet identifiers that were outstanding.
    pub fn fail_all(&mut self, reason: &str) -> Vec<u16> {
        let mut ids = Vec::with_capacity(self.entries.len());
        for (packet_id, mut entry) in std::mem::take(&mut self.entries) {
            if let Some(done) = entry.done.take() {
                let _ = done.send(Err(MqttError::closed(reason)));
            }
            ids.push(packet_id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn state_of(&self, packet_id: u16) -> Option<DeliveryState> {
        self.entries.get(&packet_id).map(|entry| entry.state)
    }
}

/// Inbound QoS 2 phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundPhase {
    /// Publish received; still queued for delivery, PUBREC not yet sent
    ReceivedPending,
    /// PUBREC sent, awaiting PUBREL
    RecSent,
}

/// How to treat an inbound QoS 2 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDisposition {
    /// First copy: deliver to the application
    Deliver,
    /// Duplicate of a copy still queued for delivery: drop silently
    DropDuplicate,
    /// Duplicate of an already-acknowledged copy: answer with PUBREC only
    ResendPubRec,
}

/// Dedupe table for inbound QoS 2 publishes. Entries survive reconnects so
/// a redelivered duplicate after resumption is never handed to the
/// application again.
#[derive(Debug, Default)]
pub struct InboundQos2Table {
    entries: HashMap<u16, InboundPhase>,
}

impl InboundQos2Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_publish(&mut self, packet_id: u16) -> InboundDisposition {
        match self.entries.get(&packet_id) {
            None => {
                self.entries.insert(packet_id, InboundPhase::ReceivedPending);
                InboundDisposition::Deliver
            }
            Some(InboundPhase::ReceivedPending) => InboundDisposition::DropDuplicate,
            Some(InboundPhase::RecSent) => InboundDisposition::ResendPubRec,
        }
    }

    pub fn mark_rec_sent(&mut self, packet_id: u16) {
        self.entries.insert(packet_id, InboundPhase::RecSent);
    }

    /// PUBREL closes the handshake; PUBCOMP is always the answer, even for
    /// an unknown identifier (the broker may be retrying after our PUBCOMP
    /// was lost).
    pub fn handle_pubrel(&mut self, packet_id: u16) -> ControlPacket {
        self.entries.remove(&packet_id);
        ControlPacket::PubComp { packet_id }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(qos: QoS, packet_id: u16) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "a/b".to_string(),
            packet_id: Some(packet_id),
            payload: Bytes::from_static(b"x"),
        }
    }

    fn register(table: &mut OutboundTable, qos: QoS, packet_id: u16) -> oneshot::Receiver<MqttResult<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        table.register(publish(qos, packet_id), done_tx).unwrap();
        table.mark_written(packet_id);
        done_rx
    }

    #[test]
    fn test_qos1_handshake() {
        let mut table = OutboundTable::new();
        let mut done = register(&mut table, QoS::AtLeastOnce, 1);

        assert_eq!(
            table.handle_puback(1).unwrap(),
            AckAction::Completed { packet_id: 1 }
        );
        assert!(table.is_empty());
        assert!(done.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_duplicate_puback_is_ignored() {
        let mut table = OutboundTable::new();
        let _done = register(&mut table, QoS::AtLeastOnce, 1);

        assert_eq!(
            table.handle_puback(1).unwrap(),
            AckAction::Completed { packet_id: 1 }
        );
        // Second PUBACK for the completed identifier: idempotent.
        assert_eq!(table.handle_puback(1).unwrap(), AckAction::None);
    }

    #[test]
    fn test_exactly_one_completion_under_duplicate_puback() {
        let mut table = OutboundTable::new();
        let mut done = register(&mut table, QoS::AtLeastOnce, 3);

        table.handle_puback(3).unwrap();
        table.handle_puback(3).unwrap();
        table.handle_puback(3).unwrap();

        // The waiter saw exactly one completion.
        assert!(done.try_recv().unwrap().is_ok());
        assert!(done.try_recv().is_err());
    }

    #[test]
    fn test_qos2_handshake() {
        let mut table = OutboundTable::new();
        let mut done = register(&mut table, QoS::ExactlyOnce, 2);

        assert_eq!(
            table.handle_pubrec(2).unwrap(),
            AckAction::SendPubRel { packet_id: 2 }
        );
        assert_eq!(table.state_of(2), Some(DeliveryState::PubRecReceived));

        table.mark_pubrel_sent(2);
        assert_eq!(table.state_of(2), Some(DeliveryState::PubCompPending));

        assert_eq!(
            table.handle_pubcomp(2).unwrap(),
            AckAction::Completed { packet_id: 2 }
        );
        assert!(done.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_pubcomp_before_pubrec_is_violation() {
        let mut table = OutboundTable::new();
        let _done = register(&mut table, QoS::ExactlyOnce, 5);

        assert!(matches!(
            table.handle_pubcomp(5),
            Err(MqttError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_puback_for_qos2_is_violation() {
        let mut table = OutboundTable::new();
        let _done = register(&mut table, QoS::ExactlyOnce, 5);

        assert!(matches!(
            table.handle_puback(5),
            Err(MqttError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_duplicate_pubrec_resends_pubrel() {
        let mut table = OutboundTable::new();
        let _done = register(&mut table, QoS::ExactlyOnce, 7);

        table.handle_pubrec(7).unwrap();
        table.mark_pubrel_sent(7);
        // Broker lost our PUBREL and retries PUBREC.
        assert_eq!(
            table.handle_pubrec(7).unwrap(),
            AckAction::SendPubRel { packet_id: 7 }
        );
    }

    #[test]
    fn test_replay_sets_dup_and_skips_unwritten() {
        let mut table = OutboundTable::new();
        let (done_tx, _done_rx) = oneshot::channel();
        table.register(publish(QoS::AtLeastOnce, 1), done_tx).unwrap();
        table.mark_written(1);

        // Never written: still queued, must not be replayed.
        let (done_tx, _done_rx) = oneshot::channel();
        table.register(publish(QoS::AtLeastOnce, 2), done_tx).unwrap();

        // QoS 2 past PUBREC: replay resumes with PUBREL, not the publish.
        let (done_tx, _done_rx) = oneshot::channel();
        table.register(publish(QoS::ExactlyOnce, 3), done_tx).unwrap();
        table.mark_written(3);
        table.handle_pubrec(3).unwrap();
        table.mark_pubrel_sent(3);

        let frames = table.replay_frames();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            ControlPacket::Publish(publish) => {
                assert!(publish.dup);
                assert_eq!(publish.packet_id, Some(1));
            }
            other => panic!("expected publish, got {other:?}"),
        }
        assert_eq!(frames[1], ControlPacket::PubRel { packet_id: 3 });
    }

    #[test]
    fn test_fail_all_surfaces_reason() {
        let mut table = OutboundTable::new();
        let mut done = register(&mut table, QoS::AtLeastOnce, 1);

        let ids = table.fail_all("protocol violation by peer");
        assert_eq!(ids, vec![1]);
        assert!(matches!(
            done.try_recv().unwrap(),
            Err(MqttError::SessionClosed { .. })
        ));
    }

    #[test]
    fn test_inbound_qos2_dedupe() {
        let mut table = InboundQos2Table::new();

        assert_eq!(table.on_publish(9), InboundDisposition::Deliver);
        // Duplicate while the first copy is still queued: dropped.
        assert_eq!(table.on_publish(9), InboundDisposition::DropDuplicate);

        table.mark_rec_sent(9);
        // Duplicate after PUBREC went out: answer PUBREC only, no redelivery.
        assert_eq!(table.on_publish(9), InboundDisposition::ResendPubRec);

        assert_eq!(
            table.handle_pubrel(9),
            ControlPacket::PubComp { packet_id: 9 }
        );
        assert!(table.is_empty());

        // After the handshake closed, the identifier is fresh again.
        assert_eq!(table.on_publish(9), InboundDisposition::Deliver);
    }

    #[test]
    fn test_pubrel_for_unknown_id_still_answered() {
        let mut table = InboundQos2Table::new();
        assert_eq!(
            table.handle_pubrel(42),
            ControlPacket::PubComp { packet_id: 42 }
        );
    }
}
