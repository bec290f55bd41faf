//! Session state machine
//!
//! [`SessionCore`] is the single-mutex heart of a client session: the
//! protocol state, the in-flight acknowledgment tables, the packet
//! identifier pool and the waiters for SUBACK/UNSUBACK handshakes.
//! Operations are short and never held across an await; everything
//! asynchronous happens through channels owned by the connection loop.

mod inflight;
mod packet_id;
mod quota;
mod state;

pub use inflight::{
    AckAction, DeliveryState, InboundDisposition, InboundQos2Table, OutboundTable,
};
pub use packet_id::PacketIdPool;
pub use quota::ReceiveQuota;
pub use state::{next_state, SessionEvent, SessionState};

use crate::codec::{ControlPacket, SubAckCode};
use crate::error::{MqttError, MqttResult};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Mutable session state, guarded by one mutex per session.
#[derive(Debug)]
pub struct SessionCore {
    state: SessionState,
    pub outbound: OutboundTable,
    pub inbound_qos2: InboundQos2Table,
    pub packet_ids: PacketIdPool,
    pending_subacks: HashMap<u16, oneshot::Sender<MqttResult<Vec<SubAckCode>>>>,
    pending_unsubacks: HashMap<u16, oneshot::Sender<MqttResult<()>>>,
    closed_reason: Option<String>,
}

impl SessionCore {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            outbound: OutboundTable::new(),
            inbound_qos2: InboundQos2Table::new(),
            packet_ids: PacketIdPool::new(),
            pending_subacks: HashMap::new(),
            pending_unsubacks: HashMap::new(),
            closed_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a lifecycle event. Illegal transitions are logged and ignored
    /// rather than corrupting state.
    pub fn apply(&mut self, event: &SessionEvent) -> SessionState {
        match next_state(self.state, event) {
            Some(next) => self.state = next,
            None => {
                warn!(current = ?self.state, ?event, "ignoring illegal session transition");
            }
        }
        self.state
    }

    /// Permanently close the session, surfacing `reason` to every waiter.
    pub fn close(&mut self, reason: &str) {
        if self.closed_reason.is_some() {
            return;
        }
        self.closed_reason = Some(reason.to_string());
        self.state = SessionState::Disconnected;
        let ids = self.outbound.fail_all(reason);
        for packet_id in ids {
            self.packet_ids.release(packet_id);
        }
        for (_, waiter) in self.pending_subacks.drain() {
            let _ = waiter.send(Err(MqttError::closed(reason)));
        }
        for (_, waiter) in self.pending_unsubacks.drain() {
            let _ = waiter.send(Err(MqttError::closed(reason)));
        }
        self.inbound_qos2.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed_reason.is_some()
    }

    pub fn closed_reason(&self) -> Option<&str> {
        self.closed_reason.as_deref()
    }

    /// Transient connection loss: subscription handshakes in flight fail
    /// (the caller can retry), but publish handshakes stay open for replay
    /// after resumption.
    pub fn connection_lost(&mut self, reason: &str) {
        self.apply(&SessionEvent::ConnectionLost(reason.to_string()));
        for (packet_id, waiter) in self.pending_subacks.drain() {
            self.packet_ids.release(packet_id);
            let _ = waiter.send(Err(MqttError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                reason.to_string(),
            ))));
        }
        for (packet_id, waiter) in self.pending_unsubacks.drain() {
            self.packet_ids.release(packet_id);
            let _ = waiter.send(Err(MqttError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                reason.to_string(),
            ))));
        }
    }

    /// Handle CONNACK session state. Returns the frames to replay when the
    /// broker resumed our session; otherwise clears per-session state.
    pub fn on_connected(&mut self, session_present: bool) -> Vec<ControlPacket> {
        self.apply(&SessionEvent::ConnAckAccepted);
        if session_present {
            let frames = self.outbound.replay_frames();
            if !frames.is_empty() {
                debug!(count = frames.len(), "replaying in-flight frames after resumption");
            }
            frames
        } else {
            // Fresh session on the broker side: nothing can be resumed.
            let ids = self.outbound.fail_all("session not resumed by broker");
            for packet_id in ids {
                self.packet_ids.release(packet_id);
            }
            self.inbound_qos2.clear();
            Vec::new()
        }
    }

    pub fn register_suback_waiter(
        &mut self,
        packet_id: u16,
        waiter: oneshot::Sender<MqttResult<Vec<SubAckCode>>>,
    ) {
        self.pending_subacks.insert(packet_id, waiter);
    }

    pub fn register_unsuback_waiter(
        &mut self,
        packet_id: u16,
        waiter: oneshot::Sender<MqttResult<()>>,
    ) {
        self.pending_unsubacks.insert(packet_id, waiter);
    }

    pub fn handle_suback(&mut self, packet_id: u16, codes: Vec<SubAckCode>) -> MqttResult<()> {
        match self.pending_subacks.remove(&packet_id) {
            Some(waiter) => {
                self.packet_ids.release(packet_id);
                let _ = waiter.send(Ok(codes));
            }
            // The waiter was already failed by a connection loss that raced
            // the broker's answer. The identifier was released then.
            None => {
                debug!(packet_id, "SUBACK for unknown packet identifier");
            }
        }
        Ok(())
    }

    pub fn handle_unsuback(&mut self, packet_id: u16) -> MqttResult<()> {
        match self.pending_unsubacks.remove(&packet_id) {
            Some(waiter) => {
                self.packet_ids.release(packet_id);
                let _ = waiter.send(Ok(()));
            }
            None => {
                debug!(packet_id, "UNSUBACK for unknown packet identifier");
            }
        }
        Ok(())
    }

    /// Fail a SUBSCRIBE/UNSUBSCRIBE handshake whose packet could not be
    /// written (connection went away before the writer got to it).
    pub fn fail_handshake(&mut self, packet_id: u16) {
        let state = self.state;
        if let Some(waiter) = self.pending_subacks.remove(&packet_id) {
            self.packet_ids.release(packet_id);
            let _ = waiter.send(Err(MqttError::NotConnected { state }));
            return;
        }
        if let Some(waiter) = self.pending_unsubacks.remove(&packet_id) {
            self.packet_ids.release(packet_id);
            let _ = waiter.send(Err(MqttError::NotConnected { state }));
        }
    }
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}
