//! Resource provider and channel contract.
//!
//! The container never talks to a broker directly. It asks a
//! [`ResourceProvider`] for one [`Channel`] per worker and drives the
//! consume/settle cycle through it. Any transport can be plugged in as long as
//! closing a channel hands its unsettled deliveries back to the broker for
//! redelivery: the at-least-once guarantee of transactional containers rests
//! on that behaviour.

use async_trait::async_trait;

use crate::config::AcknowledgeMode;
use crate::delivery::Delivery;
use crate::error::Result;

/// Options for starting a consumer on a channel.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub acknowledge_mode: AcknowledgeMode,
    pub prefetch_count: u16,
}

/// A single-owner session used to consume and settle deliveries.
///
/// Channels are never shared between workers.
#[async_trait]
pub trait Channel: Send {
    /// Transport-assigned channel number, used in logs.
    fn channel_id(&self) -> u64;

    /// Start consuming `queue`. Fails if the queue does not exist.
    async fn consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<()>;

    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` when the broker cancelled the consumer. Must be
    /// cancel safe: dropping the future before it completes loses nothing.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    /// Settle a delivery as processed.
    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<()>;

    /// Hand a delivery back to the queue for redelivery.
    async fn reject_requeue(&mut self, delivery_tag: u64) -> Result<()>;

    /// Drop a delivery without redelivery.
    async fn reject_discard(&mut self, delivery_tag: u64) -> Result<()>;

    /// Put the channel in transactional mode; settlements wait for commit.
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Apply every settlement issued since the last commit or rollback.
    async fn commit_transaction(&mut self) -> Result<()>;

    /// Discard settlements issued since the last commit.
    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Close the channel. Unsettled deliveries return to the broker.
    async fn close(&mut self) -> Result<()>;
}

/// Supplies channels. Must be safe for concurrent acquisition.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn acquire_channel(&self) -> Result<Box<dyn Channel>>;
}
