//! Requeue policy
//!
//! A policy maps a dispatch [`Outcome`] to the single [`Disposition`] the
//! worker issues for the delivery. Policies are pure: they never touch the
//! channel and never fail.

use serde::Serialize;
use strum::Display;

use crate::delivery::Delivery;
use crate::dispatcher::Outcome;

/// Terminal settlement of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Acknowledge,
    RejectRequeue,
    RejectDiscard,
}

/// Decides the disposition of a processed delivery.
pub trait RequeuePolicy: Send + Sync {
    fn decide(&self, outcome: &Outcome, delivery: &Delivery, transactional: bool) -> Disposition;

    /// Used for logging
    fn name(&self) -> &'static str;
}

/// Requeue handler failures until a delivery-count threshold, discard the rest.
///
/// With the default threshold of 2 a failing message is retried once: the
/// first failure requeues it, a failure on the redelivery discards it.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRequeuePolicy {
    max_deliveries: u32,
}

impl DefaultRequeuePolicy {
    pub const DEFAULT_MAX_DELIVERIES: u32 = 2;

    /// `max_deliveries` counts the first delivery; 1 disables requeueing.
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: max_deliveries.max(1),
        }
    }

    pub fn max_deliveries(&self) -> u32 {
        self.max_deliveries
    }
}

impl Default for DefaultRequeuePolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_DELIVERIES)
    }
}

impl RequeuePolicy for DefaultRequeuePolicy {
    // Success settles the same way in both modes; the worker commits after
    // acknowledging when the channel is transactional.
    fn decide(&self, outcome: &Outcome, delivery: &Delivery, _transactional: bool) -> Disposition {
        match outcome {
            Outcome::Success => Disposition::Acknowledge,
            Outcome::HandlerFailure(_) if delivery.delivery_count < self.max_deliveries => {
                Disposition::RejectRequeue
            }
            Outcome::HandlerFailure(_) | Outcome::Rejected(_) | Outcome::Fatal(_) => {
                Disposition::RejectDiscard
            }
        }
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Never requeue: every failed delivery is discarded on first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAndDontRequeuePolicy;

impl RequeuePolicy for RejectAndDontRequeuePolicy {
    fn decide(&self, outcome: &Outcome, _delivery: &Delivery, _transactional: bool) -> Disposition {
        if outcome.is_success() {
            Disposition::Acknowledge
        } else {
            Disposition::RejectDiscard
        }
    }

    fn name(&self) -> &'static str {
        "reject_and_dont_requeue"
    }
}
