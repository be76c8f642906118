//! Per-generation supervisor
//!
//! Owns the worker tasks of one generation. A slot whose worker exits is
//! either left stopped, recreated on a fresh channel, or marked failed.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::error::ContainerError;
use crate::state::WorkerStatus;
use crate::transport::Channel;
use crate::worker::{ConsumerWorker, ContainerCore, WorkerExit};

pub(crate) struct Supervisor {
    core: Arc<ContainerCore>,
    generation: u64,
    stop: CancellationToken,
    kill: CancellationToken,
    runtime: Handle,
    tasks: JoinSet<(usize, WorkerExit)>,
}

impl Supervisor {
    pub(crate) fn new(
        core: Arc<ContainerCore>,
        generation: u64,
        stop: CancellationToken,
        kill: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            core,
            generation,
            stop,
            kill,
            runtime,
            tasks: JoinSet::new(),
        }
    }

    /// Start a worker on a channel that is already consuming.
    pub(crate) fn spawn_worker(&mut self, slot: usize, channel: Box<dyn Channel>) {
        self.spawn_slot(slot, Some(channel), None);
    }

    /// Spawn the task for `slot`. Without a channel the task acquires one,
    /// after `delay` when given.
    ///
    /// A slot counts as active only while its worker holds a channel.
    fn spawn_slot(&mut self, slot: usize, channel: Option<Box<dyn Channel>>, delay: Option<Duration>) {
        let core = self.core.clone();
        let generation = self.generation;
        let stop = self.stop.clone();
        let kill = self.kill.clone();

        if channel.is_some() {
            worker_alive(&core, generation);
        }

        let task = async move {
            let channel = match channel {
                Some(channel) => channel,
                None => {
                    if let Some(delay) = delay {
                        tokio::select! {
                            _ = stop.cancelled() => return WorkerExit::Stopped,
                            _ = kill.cancelled() => return WorkerExit::Killed,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    match core.open_channel(slot).await {
                        Ok(channel) => {
                            worker_alive(&core, generation);
                            channel
                        }
                        Err(err) => return WorkerExit::Failed(err),
                    }
                }
            };

            let worker = ConsumerWorker::new(slot, generation, channel, core.clone(), stop, kill);
            let exit = AssertUnwindSafe(worker.run())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| WorkerExit::Failed(ContainerError::transport("worker panicked")));

            core.shared.worker_exited(generation);
            core.metrics.set_active_workers(core.shared.active_workers());
            exit
        };

        let span = info_span!("consumer", slot, generation);
        self.tasks
            .spawn_on(task.map(move |exit| (slot, exit)).instrument(span), &self.runtime);
    }

    /// Drive the generation until every slot has ended.
    pub(crate) async fn run(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((slot, exit)) => self.on_exit(slot, exit),
                Err(err) => debug!(error = %err, "Worker task aborted"),
            }
        }
        debug!(generation = self.generation, "All workers of generation finished");
    }

    fn on_exit(&mut self, slot: usize, exit: WorkerExit) {
        let generation = self.generation;
        let stopping = self.stop.is_cancelled() || self.kill.is_cancelled();

        match exit {
            WorkerExit::Stopped | WorkerExit::Killed => {
                self.core.shared.update_slot(generation, slot, |record| {
                    record.status = WorkerStatus::Stopped;
                });
            }
            WorkerExit::Restart(reason) => {
                self.core.shared.update_slot(generation, slot, |record| {
                    record.last_error = Some(reason.clone());
                    record.last_error_at = Some(chrono::Utc::now());
                    record.status = WorkerStatus::Stopped;
                });
                if stopping {
                    return;
                }
                self.restart(slot, None, "fatal");
            }
            WorkerExit::Failed(err) => {
                error!(slot, error = %err, "Worker slot failed");
                self.core.metrics.worker_failed();
                self.core
                    .shared
                    .update_slot(generation, slot, |record| record.fail(err.to_string()));
                if stopping {
                    return;
                }
                match self.core.config.recovery_interval {
                    Some(interval) => self.restart(slot, Some(interval), "transport"),
                    None => warn!(slot, "Slot stays failed until the next start"),
                }
            }
        }
    }

    fn restart(&mut self, slot: usize, delay: Option<Duration>, reason: &'static str) {
        debug!(slot, ?delay, reason, "Recreating worker slot");
        self.core.metrics.worker_restarted(reason);
        self.core.shared.update_slot(self.generation, slot, |record| {
            record.status = WorkerStatus::Recovering;
            record.restarts += 1;
        });
        self.spawn_slot(slot, None, delay);
    }
}

fn worker_alive(core: &ContainerCore, generation: u64) {
    core.shared.worker_spawned(generation);
    core.metrics.set_active_workers(core.shared.active_workers());
}
