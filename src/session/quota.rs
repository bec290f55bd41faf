//! Receive quota for inbound flow control
//!
//! Bounds the number of unacknowledged QoS>0 inbound messages. Decremented
//! on receipt, incremented when the acknowledgment goes out. The counter
//! can never go negative: at zero, further inbound QoS>0 messages are held
//! unacknowledged, which is the protocol-level pause toward the broker.

use tracing::warn;

#[derive(Debug)]
pub struct ReceiveQuota {
    capacity: u16,
    available: u16,
}

impl ReceiveQuota {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity,
            available: capacity,
        }
    }

    /// Take one unit of quota for a newly received QoS>0 message.
    /// Returns false when exhausted.
    pub fn try_acquire(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Return one unit after the acknowledgment was sent.
    pub fn release(&mut self) {
        if self.available >= self.capacity {
            warn!("receive quota released above capacity; ignoring");
            return;
        }
        self.available += 1;
    }

    pub fn available(&self) -> u16 {
        self.available
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn is_exhausted(&self) -> bool {
        self.available == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let mut quota = ReceiveQuota::new(2);
        assert!(quota.try_acquire());
        assert!(quota.try_acquire());
        assert!(quota.is_exhausted());
        assert!(!quota.try_acquire(), "must not go negative");
        assert_eq!(quota.available(), 0);
    }

    #[test]
    fn test_release_frees_capacity() {
        let mut quota = ReceiveQuota::new(1);
        assert!(quota.try_acquire());
        assert!(!quota.try_acquire());
        quota.release();
        assert!(quota.try_acquire());
    }

    #[test]
    fn test_release_is_capped_at_capacity() {
        let mut quota = ReceiveQuota::new(3);
        quota.release();
        quota.release();
        assert_eq!(quota.available(), 3, "release above capacity is ignored");
    }
}
