//! Consumer worker
//!
//! One worker per concurrency slot. A worker owns its channel exclusively and
//! runs the receive → dispatch → settle cycle until it is told to stop, its
//! channel fails, or a delivery ends `Fatal`.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AcknowledgeMode, ContainerConfig};
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::delivery::{Delivery, DeliveryTracker};
use crate::dispatcher::Dispatch;
use crate::error::{ContainerError, Result};
use crate::metrics::ContainerMetrics;
use crate::policy::{Disposition, RequeuePolicy};
use crate::state::{ContainerShared, WorkerStatus};
use crate::transport::{Channel, ConsumeOptions, ResourceProvider};

/// Everything a worker needs that outlives a single generation.
pub(crate) struct ContainerCore {
    pub(crate) config: ContainerConfig,
    pub(crate) provider: Arc<dyn ResourceProvider>,
    pub(crate) dispatcher: Arc<dyn Dispatch>,
    pub(crate) policy: Arc<dyn RequeuePolicy>,
    pub(crate) dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub(crate) metrics: ContainerMetrics,
    pub(crate) shared: ContainerShared,
}

impl ContainerCore {
    /// Acquire a channel and put it in consuming state for `slot`.
    ///
    /// On failure the partially set-up channel is closed before returning.
    pub(crate) async fn open_channel(&self, slot: usize) -> Result<Box<dyn Channel>> {
        let mut channel = self.provider.acquire_channel().await?;

        let options = ConsumeOptions {
            consumer_tag: self.config.consumer_tag(slot),
            acknowledge_mode: self.config.acknowledge_mode,
            prefetch_count: self.config.prefetch_count,
        };

        let setup = async {
            channel.consume(&self.config.queue_name, &options).await?;
            if self.config.transactional {
                channel.begin_transaction().await?;
            }
            Ok::<_, ContainerError>(())
        }
        .await;

        if let Err(err) = setup {
            if let Err(close_err) = channel.close().await {
                debug!(slot, error = %close_err, "Failed to close channel after setup error");
            }
            return Err(err);
        }

        debug!(
            slot,
            channel = channel.channel_id(),
            consumer_tag = %options.consumer_tag,
            "Channel ready"
        );
        Ok(channel)
    }
}

/// Why a worker left its loop.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// Stop requested; the in-flight delivery (if any) was settled.
    Stopped,
    /// Shutdown cancelled the worker without draining.
    Killed,
    /// A delivery ended `Fatal`; the slot wants a fresh channel.
    Restart(String),
    /// Channel or protocol failure.
    Failed(ContainerError),
}

pub(crate) struct ConsumerWorker {
    slot: usize,
    generation: u64,
    channel: Box<dyn Channel>,
    tracker: DeliveryTracker,
    core: Arc<ContainerCore>,
    stop: CancellationToken,
    kill: CancellationToken,
    status: WorkerStatus,
}

impl ConsumerWorker {
    pub(crate) fn new(
        slot: usize,
        generation: u64,
        channel: Box<dyn Channel>,
        core: Arc<ContainerCore>,
        stop: CancellationToken,
        kill: CancellationToken,
    ) -> Self {
        Self {
            slot,
            generation,
            channel,
            tracker: DeliveryTracker::new(),
            core,
            stop,
            kill,
            status: WorkerStatus::Starting,
        }
    }

    /// Run until stopped or failed, then close the channel.
    pub(crate) async fn run(mut self) -> WorkerExit {
        info!(
            slot = self.slot,
            channel = self.channel.channel_id(),
            "Consumer worker started"
        );

        let exit = self.consume_loop().await;

        // Unsettled deliveries go back to the broker with the channel.
        if let Err(err) = self.channel.close().await {
            debug!(slot = self.slot, error = %err, "Channel close failed");
        }
        if self.tracker.outstanding() > 0 {
            debug!(
                slot = self.slot,
                outstanding = self.tracker.outstanding(),
                "Returning unsettled deliveries to the broker"
            );
            self.tracker.clear();
        }

        match &exit {
            WorkerExit::Stopped | WorkerExit::Killed => {
                info!(slot = self.slot, "Consumer worker stopped")
            }
            WorkerExit::Restart(reason) => {
                warn!(slot = self.slot, reason = %reason, "Consumer worker restarting")
            }
            WorkerExit::Failed(err) => {
                error!(slot = self.slot, error = %err, "Consumer worker failed")
            }
        }
        exit
    }

    async fn consume_loop(&mut self) -> WorkerExit {
        let stop = self.stop.clone();
        let kill = self.kill.clone();

        loop {
            self.set_status(WorkerStatus::Idle);

            let next = tokio::select! {
                biased;
                _ = kill.cancelled() => return WorkerExit::Killed,
                _ = stop.cancelled() => return WorkerExit::Stopped,
                next = self.channel.next_delivery() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    return WorkerExit::Failed(ContainerError::transport(
                        "consumer cancelled by broker",
                    ));
                }
                Err(err) => return WorkerExit::Failed(err),
            };

            // A received delivery is finished even if stop arrives meanwhile;
            // only shutdown abandons it.
            self.set_status(WorkerStatus::Processing);
            let handled = tokio::select! {
                biased;
                _ = kill.cancelled() => return WorkerExit::Killed,
                handled = self.handle(delivery) => handled,
            };

            match handled {
                Ok(None) => {}
                Ok(Some(reason)) => return WorkerExit::Restart(reason),
                Err(err) => return WorkerExit::Failed(err),
            }
        }
    }

    /// Process one delivery. Returns the restart reason for `Fatal` outcomes.
    async fn handle(&mut self, delivery: Delivery) -> Result<Option<String>> {
        let tag = delivery.delivery_tag;
        self.core.metrics.delivery_received(delivery.redelivered);
        self.tracker.receive(tag)?;

        let settle_on_receipt = self.core.config.acknowledge_mode == AcknowledgeMode::None;
        if settle_on_receipt {
            // The broker already considers it settled.
            self.tracker.settle(tag)?;
            self.core.metrics.delivery_settled(Disposition::Acknowledge);
        }

        let started = Instant::now();
        let outcome = self.core.dispatcher.dispatch(&delivery, self.slot).await;
        self.core
            .metrics
            .delivery_dispatched(&outcome, started.elapsed());

        if settle_on_receipt {
            if let Some(reason) = outcome.reason() {
                dead_letter(&self.core, self.slot, &delivery, reason).await;
            }
        } else {
            let disposition =
                self.core
                    .policy
                    .decide(&outcome, &delivery, self.core.config.transactional);

            debug!(
                slot = self.slot,
                delivery_tag = tag,
                outcome = outcome.label(),
                %disposition,
                "Settling delivery"
            );

            if disposition == Disposition::RejectDiscard {
                let reason = outcome.reason().unwrap_or("discarded by requeue policy");
                dead_letter(&self.core, self.slot, &delivery, reason).await;
            }
            self.settle(tag, disposition).await?;
        }

        self.core.shared.update_slot(self.generation, self.slot, |record| {
            record.processed += 1;
        });

        Ok(outcome
            .requires_restart()
            .then(|| outcome.reason().unwrap_or("fatal outcome").to_string()))
    }

    /// Issue the single disposition owed for `tag`, committing when transactional.
    async fn settle(&mut self, tag: u64, disposition: Disposition) -> Result<()> {
        self.tracker.settle(tag)?;

        let transactional = self.core.config.transactional;
        let mut result = match disposition {
            Disposition::Acknowledge => self.channel.acknowledge(tag).await,
            Disposition::RejectRequeue => self.channel.reject_requeue(tag).await,
            Disposition::RejectDiscard => self.channel.reject_discard(tag).await,
        };
        if result.is_ok() && transactional {
            result = self.channel.commit_transaction().await;
        }

        if let Err(err) = result {
            if transactional {
                if let Err(rollback_err) = self.channel.rollback_transaction().await {
                    debug!(slot = self.slot, error = %rollback_err, "Rollback failed");
                }
            }
            return Err(err);
        }

        self.core.metrics.delivery_settled(disposition);
        Ok(())
    }

    fn set_status(&mut self, status: WorkerStatus) {
        if self.status != status {
            self.status = status;
            self.core
                .shared
                .update_slot(self.generation, self.slot, |record| record.status = status);
        }
    }
}

/// Hand a delivery the container gives up on to the dead-letter sink.
async fn dead_letter(core: &ContainerCore, slot: usize, delivery: &Delivery, reason: &str) {
    let Some(sink) = &core.dead_letters else {
        if core.config.acknowledge_mode == AcknowledgeMode::None {
            warn!(
                slot,
                delivery_tag = delivery.delivery_tag,
                reason = %reason,
                "Delivery failed after receipt-time settlement; message dropped"
            );
        }
        return;
    };

    let entry = DeadLetterEntry::from_delivery(delivery, reason);
    match sink.publish(entry).await {
        Ok(()) => core.metrics.dead_lettered(),
        Err(err) => error!(
            slot,
            delivery_tag = delivery.delivery_tag,
            error = %err,
            "Failed to publish dead letter"
        ),
    }
}
