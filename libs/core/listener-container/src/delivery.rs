//! Deliveries and the per-channel settlement ledger.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::error::{ContainerError, Result};

/// One message received on a channel.
///
/// The delivery tag is only meaningful to the channel that produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped delivery identifier
    pub delivery_tag: u64,

    /// Raw message body
    pub payload: Vec<u8>,

    /// Broker-supplied redelivery flag
    pub redelivered: bool,

    /// How many times the broker has handed out this message, including this one
    pub delivery_count: u32,

    /// Queue the message was consumed from
    pub queue: String,

    /// Optional producer-assigned message id
    pub message_id: Option<String>,

    /// When the channel handed the delivery to the worker
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// Create a first-time delivery
    pub fn new(delivery_tag: u64, queue: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            delivery_tag,
            payload,
            redelivered: false,
            delivery_count: 1,
            queue: queue.into(),
            message_id: None,
            received_at: Utc::now(),
        }
    }

    /// Mark the delivery as the `delivery_count`-th hand-out of the message
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count.max(1);
        self.redelivered = self.delivery_count > 1;
        self
    }

    /// Set the redelivered flag for transports that do not count deliveries
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        if redelivered && self.delivery_count < 2 {
            self.delivery_count = 2;
        }
        self
    }

    /// Attach a message id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }

    /// Milliseconds since the delivery was received
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds()
    }
}

/// Ledger of deliveries a worker has received but not yet settled.
///
/// Every received tag must be settled exactly once. A second settlement, or a
/// settlement for a tag that was never received, is a disposition violation.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    outstanding: HashSet<u64>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly received delivery tag.
    pub fn receive(&mut self, delivery_tag: u64) -> Result<()> {
        if !self.outstanding.insert(delivery_tag) {
            return Err(ContainerError::DispositionViolation {
                delivery_tag,
                reason: "delivery tag received twice on the same channel".to_string(),
            });
        }
        Ok(())
    }

    /// Claim the single disposition owed for `delivery_tag`.
    pub fn settle(&mut self, delivery_tag: u64) -> Result<()> {
        if !self.outstanding.remove(&delivery_tag) {
            return Err(ContainerError::DispositionViolation {
                delivery_tag,
                reason: "delivery already settled or never received".to_string(),
            });
        }
        Ok(())
    }

    /// Number of deliveries awaiting a disposition
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Forget all outstanding tags once their channel is gone.
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_flags() {
        let first = Delivery::new(1, "q", b"a".to_vec());
        assert!(!first.is_redelivery());
        assert_eq!(first.delivery_count, 1);

        let counted = Delivery::new(2, "q", b"a".to_vec()).with_delivery_count(3);
        assert!(counted.is_redelivery());
        assert_eq!(counted.delivery_count, 3);

        let flagged = Delivery::new(3, "q", b"a".to_vec()).with_redelivered(true);
        assert_eq!(flagged.delivery_count, 2);
        assert!(flagged.age_ms() < 1000);
    }

    #[test]
    fn test_tracker_settles_once() {
        let mut tracker = DeliveryTracker::new();
        tracker.receive(1).unwrap();
        tracker.receive(2).unwrap();
        assert_eq!(tracker.outstanding(), 2);

        tracker.settle(1).unwrap();
        let err = tracker.settle(1).unwrap_err();
        assert!(matches!(
            err,
            ContainerError::DispositionViolation { delivery_tag: 1, .. }
        ));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_tracker_rejects_unknown_and_duplicate_tags() {
        let mut tracker = DeliveryTracker::new();
        assert!(tracker.settle(42).is_err());

        tracker.receive(5).unwrap();
        assert!(tracker.receive(5).is_err());

        tracker.clear();
        assert_eq!(tracker.outstanding(), 0);
    }
}
