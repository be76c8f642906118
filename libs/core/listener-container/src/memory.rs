//! In-memory broker
//!
//! A process-local transport implementing [`ResourceProvider`] with the
//! settlement semantics the container relies on:
//! - deliveries beyond the prefetch window stay on the queue (`Auto` mode)
//! - `None` mode settles on send and buffers deliveries client-side
//! - transactional settlements are buffered until commit
//! - closing or dropping a channel requeues everything it left unsettled
//!
//! It also carries fault-injection hooks used by the test-suite.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::AcknowledgeMode;
use crate::delivery::Delivery;
use crate::error::{ContainerError, Result};
use crate::transport::{Channel, ConsumeOptions, ResourceProvider};

/// Upper bound of deliveries pushed to a `None` mode consumer in one go.
const NO_ACK_PUSH_LIMIT: usize = 256;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    delivery_count: u32,
    message_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Reject { requeue: bool },
}

#[derive(Debug)]
struct Subscription {
    queue: String,
    mode: AcknowledgeMode,
    prefetch: usize,
}

#[derive(Debug, Default)]
struct ChannelState {
    subscription: Option<Subscription>,
    unacked: BTreeMap<u64, StoredMessage>,
    next_tag: u64,
    transactional: bool,
    pending: Vec<(u64, Settlement)>,
    buffered: VecDeque<Delivery>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
    /// (successful acquisitions to let through, failures after that)
    acquisition_faults: Option<(usize, usize)>,
    acknowledged: u64,
    discarded: u64,
}

impl BrokerState {
    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| ContainerError::transport(format!("channel {id} is closed")))
    }

    fn requeue(&mut self, queue: &str, messages: impl DoubleEndedIterator<Item = StoredMessage>) {
        if let Some(entries) = self.queues.get_mut(queue) {
            for message in messages.rev() {
                entries.push_front(message);
            }
        }
    }

    /// Remove a channel, returning its unsettled deliveries to their queue.
    fn close_channel(&mut self, id: u64) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };
        if let Some(subscription) = channel.subscription {
            let unacked = channel.unacked.into_values();
            self.requeue(&subscription.queue, unacked);
            if !channel.buffered.is_empty() {
                debug!(
                    channel = id,
                    lost = channel.buffered.len(),
                    "Dropping deliveries settled on receipt"
                );
            }
        }
        true
    }

    fn apply(&mut self, id: u64, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let channel = self.channel_mut(id)?;
        let Some(message) = channel.unacked.remove(&delivery_tag) else {
            self.close_channel(id);
            return Err(ContainerError::transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        let queue = channel
            .subscription
            .as_ref()
            .map(|s| s.queue.clone())
            .unwrap_or_default();

        match settlement {
            Settlement::Ack => self.acknowledged += 1,
            Settlement::Reject { requeue: true } => {
                self.requeue(&queue, std::iter::once(message));
            }
            Settlement::Reject { requeue: false } => self.discarded += 1,
        }
        Ok(())
    }

    fn settle(&mut self, id: u64, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let channel = self.channel_mut(id)?;
        if channel.transactional {
            if !channel.unacked.contains_key(&delivery_tag) {
                self.close_channel(id);
                return Err(ContainerError::transport(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )));
            }
            channel.pending.push((delivery_tag, settlement));
            return Ok(());
        }
        self.apply(id, delivery_tag, settlement)
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-local broker with queue and channel semantics.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    next_channel_id: 1,
                    ..Default::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Declare a queue if it does not exist yet
    pub fn declare_queue(&self, queue: impl Into<String>) {
        self.inner.lock().queues.entry(queue.into()).or_default();
    }

    /// Delete a queue. Consumers of the queue are cancelled.
    pub fn delete_queue(&self, queue: &str) -> usize {
        let removed = self.inner.lock().queues.remove(queue);
        self.inner.notify.notify_waiters();
        removed.map(|entries| entries.len()).unwrap_or(0)
    }

    /// Publish a message, declaring the queue on first use
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.publish_message(queue, payload.into(), None);
    }

    /// Publish a message with a producer-assigned id
    pub fn publish_with_id(&self, queue: &str, message_id: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.publish_message(queue, payload.into(), Some(message_id.into()));
    }

    fn publish_message(&self, queue: &str, payload: Vec<u8>, message_id: Option<String>) {
        {
            let mut state = self.inner.lock();
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(StoredMessage {
                    payload,
                    delivery_count: 0,
                    message_id,
                });
        }
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting on the queue (not handed out)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Deliveries handed out and not settled, across all channels
    pub fn unacked_count(&self) -> usize {
        self.inner
            .lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    /// Deliveries settled as processed (including settle-on-send)
    pub fn acknowledged_count(&self) -> u64 {
        self.inner.lock().acknowledged
    }

    /// Deliveries rejected without requeue
    pub fn discarded_count(&self) -> u64 {
        self.inner.lock().discarded
    }

    /// Channels currently open
    pub fn open_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Make the next `count` channel acquisitions fail
    pub fn fail_next_acquisitions(&self, count: usize) {
        self.fail_acquisitions_after(0, count);
    }

    /// Let `successes` acquisitions through, then fail the following `failures`
    pub fn fail_acquisitions_after(&self, successes: usize, failures: usize) {
        self.inner.lock().acquisition_faults = Some((successes, failures));
    }

    /// Drop the connection: every channel closes and its deliveries are requeued
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.lock();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in &ids {
                state.close_channel(*id);
            }
            warn!(channels = ids.len(), "Broker connection dropped");
        }
        self.inner.notify.notify_waiters();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProvider for InMemoryBroker {
    async fn acquire_channel(&self) -> Result<Box<dyn Channel>> {
        let mut state = self.inner.lock();

        if let Some((successes, failures)) = state.acquisition_faults {
            if successes > 0 {
                state.acquisition_faults = Some((successes - 1, failures));
            } else if failures > 0 {
                state.acquisition_faults = (failures > 1).then_some((0, failures - 1));
                return Err(ContainerError::transport("connection refused"));
            } else {
                state.acquisition_faults = None;
            }
        }

        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.insert(
            id,
            ChannelState {
                next_tag: 1,
                ..Default::default()
            },
        );
        debug!(channel = id, "Opened channel");

        Ok(Box::new(InMemoryChannel {
            id,
            broker: self.inner.clone(),
        }))
    }
}

/// Channel handed out by [`InMemoryBroker`]
pub struct InMemoryChannel {
    id: u64,
    broker: Arc<BrokerInner>,
}

impl InMemoryChannel {
    fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        let result = self.broker.lock().settle(self.id, delivery_tag, settlement);
        if matches!(settlement, Settlement::Reject { requeue: true }) || result.is_err() {
            self.broker.notify.notify_waiters();
        }
        result
    }

    /// Take the next delivery without waiting. `Ok(None)` means nothing is ready.
    fn poll_delivery(&self) -> Result<Poll> {
        let mut state = self.broker.lock();
        let BrokerState {
            queues,
            channels,
            acknowledged,
            ..
        } = &mut *state;

        let channel = channels
            .get_mut(&self.id)
            .ok_or_else(|| ContainerError::transport(format!("channel {} is closed", self.id)))?;
        let Some(subscription) = channel.subscription.as_ref() else {
            return Err(ContainerError::transport("channel is not consuming"));
        };

        if let Some(delivery) = channel.buffered.pop_front() {
            return Ok(Poll::Ready(delivery));
        }

        let Some(queue) = queues.get_mut(&subscription.queue) else {
            return Ok(Poll::Cancelled);
        };
        let queue_name = subscription.queue.clone();

        match subscription.mode {
            AcknowledgeMode::Auto => {
                if channel.unacked.len() >= subscription.prefetch {
                    return Ok(Poll::Pending);
                }
                let Some(mut message) = queue.pop_front() else {
                    return Ok(Poll::Pending);
                };
                message.delivery_count += 1;
                let tag = channel.next_tag;
                channel.next_tag += 1;
                let delivery = to_delivery(tag, &queue_name, &message);
                channel.unacked.insert(tag, message);
                Ok(Poll::Ready(delivery))
            }
            AcknowledgeMode::None => {
                while channel.buffered.len() < NO_ACK_PUSH_LIMIT {
                    let Some(mut message) = queue.pop_front() else {
                        break;
                    };
                    message.delivery_count += 1;
                    let tag = channel.next_tag;
                    channel.next_tag += 1;
                    *acknowledged += 1;
                    channel.buffered.push_back(to_delivery(tag, &queue_name, &message));
                }
                Ok(channel
                    .buffered
                    .pop_front()
                    .map(Poll::Ready)
                    .unwrap_or(Poll::Pending))
            }
        }
    }
}

enum Poll {
    Ready(Delivery),
    Pending,
    Cancelled,
}

fn to_delivery(tag: u64, queue: &str, message: &StoredMessage) -> Delivery {
    let delivery = Delivery::new(tag, queue, message.payload.clone())
        .with_delivery_count(message.delivery_count);
    match &message.message_id {
        Some(id) => delivery.with_message_id(id.clone()),
        None => delivery,
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn channel_id(&self) -> u64 {
        self.id
    }

    async fn consume(&mut self, queue: &str, options: &ConsumeOptions) -> Result<()> {
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(ContainerError::transport(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        let channel = state.channel_mut(self.id)?;
        if channel.subscription.is_some() {
            return Err(ContainerError::transport("channel is already consuming"));
        }
        channel.subscription = Some(Subscription {
            queue: queue.to_string(),
            mode: options.acknowledge_mode,
            prefetch: usize::from(options.prefetch_count.max(1)),
        });
        debug!(
            channel = self.id,
            queue = %queue,
            consumer_tag = %options.consumer_tag,
            "Consumer registered"
        );
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        loop {
            // Register interest before inspecting state so a publish between the
            // check and the await is not missed.
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll_delivery()? {
                Poll::Ready(delivery) => return Ok(Some(delivery)),
                Poll::Cancelled => return Ok(None),
                Poll::Pending => notified.await,
            }
        }
    }

    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag, Settlement::Ack)
    }

    async fn reject_requeue(&mut self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag, Settlement::Reject { requeue: true })
    }

    async fn reject_discard(&mut self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag, Settlement::Reject { requeue: false })
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.broker.lock().channel_mut(self.id)?.transactional = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        {
            let mut state = self.broker.lock();
            let channel = state.channel_mut(self.id)?;
            if !channel.transactional {
                return Err(ContainerError::transport(
                    "PRECONDITION_FAILED - channel is not transactional",
                ));
            }
            let pending = std::mem::take(&mut channel.pending);
            for (delivery_tag, settlement) in pending {
                state.apply(self.id, delivery_tag, settlement)?;
            }
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        let mut state = self.broker.lock();
        let channel = state.channel_mut(self.id)?;
        if !channel.transactional {
            return Err(ContainerError::transport(
                "PRECONDITION_FAILED - channel is not transactional",
            ));
        }
        channel.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let closed = self.broker.lock().close_channel(self.id);
        if closed {
            debug!(channel = self.id, "Closed channel");
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if self.broker.lock().close_channel(self.id) {
            self.broker.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(mode: AcknowledgeMode, prefetch: u16) -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: "test-0".to_string(),
            acknowledge_mode: mode,
            prefetch_count: prefetch,
        }
    }

    async fn consuming(broker: &InMemoryBroker, mode: AcknowledgeMode, prefetch: u16) -> Box<dyn Channel> {
        let mut channel = broker.acquire_channel().await.unwrap();
        channel.consume("q", &options(mode, prefetch)).await.unwrap();
        channel
    }

    async fn next(channel: &mut Box<dyn Channel>) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(50), channel.next_delivery())
            .await
            .ok()
            .and_then(|result| result.unwrap())
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "hello");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;

        let delivery = next(&mut channel).await.unwrap();
        assert_eq!(delivery.payload, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        channel.acknowledge(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.acknowledged_count(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_window_blocks_further_deliveries() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        broker.publish("q", "b");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;

        let first = next(&mut channel).await.unwrap();
        assert!(next(&mut channel).await.is_none());
        assert_eq!(broker.queue_depth("q"), 1);

        channel.acknowledge(first.delivery_tag).await.unwrap();
        let second = next(&mut channel).await.unwrap();
        assert_eq!(second.payload, b"b");
    }

    #[tokio::test]
    async fn test_close_requeues_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
        let _ = next(&mut channel).await.unwrap();

        channel.close().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.open_channels(), 0);

        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
        let again = next(&mut channel).await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_drop_requeues_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        {
            let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
            let _ = next(&mut channel).await.unwrap();
        }
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_reject_requeue_and_discard() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;

        let first = next(&mut channel).await.unwrap();
        channel.reject_requeue(first.delivery_tag).await.unwrap();

        let second = next(&mut channel).await.unwrap();
        assert!(second.redelivered);
        channel.reject_discard(second.delivery_tag).await.unwrap();

        assert_eq!(broker.discarded_count(), 1);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_double_settlement_closes_channel() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
        let delivery = next(&mut channel).await.unwrap();

        channel.acknowledge(delivery.delivery_tag).await.unwrap();
        let err = channel.acknowledge(delivery.delivery_tag).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_transaction_buffers_until_commit() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        broker.publish("q", "b");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
        channel.begin_transaction().await.unwrap();

        let first = next(&mut channel).await.unwrap();
        channel.acknowledge(first.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 1);
        channel.rollback_transaction().await.unwrap();
        assert_eq!(broker.unacked_count(), 1);

        channel.acknowledge(first.delivery_tag).await.unwrap();
        channel.commit_transaction().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acknowledged_count(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_settlement_is_requeued_on_close() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "a");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
        channel.begin_transaction().await.unwrap();

        let delivery = next(&mut channel).await.unwrap();
        channel.acknowledge(delivery.delivery_tag).await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.acknowledged_count(), 0);
    }

    #[tokio::test]
    async fn test_no_ack_mode_loses_buffered_deliveries_on_close() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker.publish("q", format!("m{i}"));
        }
        let mut channel = consuming(&broker, AcknowledgeMode::None, 1).await;

        let first = next(&mut channel).await.unwrap();
        assert_eq!(first.payload, b"m0");
        assert_eq!(broker.unacked_count(), 0);

        channel.close().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.acknowledged_count(), 3);
    }

    #[tokio::test]
    async fn test_consume_unknown_queue_fails() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.acquire_channel().await.unwrap();
        let err = channel
            .consume("missing", &options(AcknowledgeMode::Auto, 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOT_FOUND"));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_deleting_queue_cancels_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;

        let waiter = tokio::spawn(async move { channel.next_delivery().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.delete_queue("q");

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_fails_blocked_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;

        let waiter = tokio::spawn(async move { channel.next_delivery().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.disconnect();

        let result = waiter.await.unwrap();
        assert!(result.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_cancelled_wait_loses_nothing() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;

        assert!(next(&mut channel).await.is_none());
        broker.publish("q", "late");
        let delivery = next(&mut channel).await.unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_acquisition_faults() {
        let broker = InMemoryBroker::new();
        broker.fail_acquisitions_after(1, 2);

        assert!(broker.acquire_channel().await.is_ok());
        assert!(broker.acquire_channel().await.is_err());
        assert!(broker.acquire_channel().await.is_err());
        assert!(broker.acquire_channel().await.is_ok());
    }

    #[tokio::test]
    async fn test_message_id_is_carried() {
        let broker = InMemoryBroker::new();
        broker.publish_with_id("q", "order-17", "{}");
        let mut channel = consuming(&broker, AcknowledgeMode::Auto, 1).await;
        let delivery = next(&mut channel).await.unwrap();
        assert_eq!(delivery.message_id.as_deref(), Some("order-17"));
        assert_eq!(delivery.queue, "q");
    }
}
