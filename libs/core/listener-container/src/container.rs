//! Listener container controller
//!
//! Owns the lifecycle state machine and the worker generations:
//! - `start()` acquires every channel before any worker runs (all-or-nothing)
//! - `stop()` lets in-flight deliveries settle, bounded by the drain timeout
//! - `shutdown()` cancels everything and makes the container unusable
//!
//! Lifecycle calls are serialized internally; they can be issued from any task.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ContainerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{ContainerError, Result};
use crate::listener::MessageListener;
use crate::metrics::ContainerMetrics;
use crate::payload::FromPayload;
use crate::policy::{DefaultRequeuePolicy, RequeuePolicy};
use crate::state::{ContainerShared, ContainerSnapshot, LifecycleState};
use crate::supervisor::Supervisor;
use crate::transport::ResourceProvider;
use crate::worker::ContainerCore;

/// A listener bound to its queue settings, ready to be turned into a container.
pub struct ListenerRegistration {
    config: ContainerConfig,
    dispatcher: Arc<dyn Dispatch>,
    policy: Arc<dyn RequeuePolicy>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl ListenerRegistration {
    /// Bind `listener` to `config`. The payload type is fixed here.
    pub fn new<P, L>(config: ContainerConfig, listener: L) -> Self
    where
        P: FromPayload,
        L: MessageListener<P>,
    {
        Self::from_arc(config, Arc::new(listener))
    }

    /// Same as [`ListenerRegistration::new`] for a listener shared elsewhere
    pub fn from_arc<P, L>(config: ContainerConfig, listener: Arc<L>) -> Self
    where
        P: FromPayload,
        L: MessageListener<P>,
    {
        let dispatcher =
            Dispatcher::from_arc(listener).with_receive_timeout(config.receive_timeout);
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            policy: Arc::new(DefaultRequeuePolicy::default()),
            dead_letters: None,
        }
    }

    /// Replace the default requeue policy
    pub fn with_policy(mut self, policy: impl RequeuePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Publish discarded deliveries to `sink` first
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn listener_name(&self) -> &'static str {
        self.dispatcher.listener_name()
    }
}

/// Register `listener` on `queue` and build its container (state NEW).
pub fn register_listener<P, L>(
    provider: Arc<dyn ResourceProvider>,
    queue: impl Into<String>,
    listener: L,
    concurrency: usize,
    transactional: bool,
) -> Result<ListenerContainer>
where
    P: FromPayload,
    L: MessageListener<P>,
{
    let config = ContainerConfig::new(queue)
        .with_concurrency(concurrency)
        .with_transactional(transactional);
    ListenerContainer::new(provider, ListenerRegistration::new(config, listener))
}

struct Generation {
    id: u64,
    stop: CancellationToken,
    kill: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Supervises `concurrency` consumer workers for one queue.
pub struct ListenerContainer {
    core: Arc<ContainerCore>,
    current: Mutex<Option<Generation>>,
    state: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    runtime: Option<Handle>,
}

impl ListenerContainer {
    /// Create a container in state NEW. Fails on invalid configuration.
    pub fn new(provider: Arc<dyn ResourceProvider>, registration: ListenerRegistration) -> Result<Self> {
        let ListenerRegistration {
            config,
            dispatcher,
            policy,
            dead_letters,
        } = registration;
        config.validate()?;

        info!(
            queue = %config.queue_name,
            listener = dispatcher.listener_name(),
            policy = policy.name(),
            concurrency = config.concurrency,
            transactional = config.transactional,
            acknowledge_mode = %config.acknowledge_mode,
            "Listener registered"
        );

        let (state, _) = watch::channel(LifecycleState::New);
        Ok(Self {
            core: Arc::new(ContainerCore {
                metrics: ContainerMetrics::new(config.queue_name.clone()),
                shared: ContainerShared::new(config.concurrency),
                config,
                provider,
                dispatcher,
                policy,
                dead_letters,
            }),
            current: Mutex::new(None),
            state,
            shutdown: CancellationToken::new(),
            runtime: None,
        })
    }

    /// Run workers on `runtime` instead of the runtime calling `start()`
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Start a new generation of workers.
    ///
    /// Valid from NEW and STOPPED. Every channel is acquired before any worker
    /// runs; if one acquisition fails the others are closed and the error is
    /// returned with the state unchanged.
    pub async fn start(&self) -> Result<()> {
        let mut current = self.current.lock().await;

        let state = self.state();
        if self.shutdown.is_cancelled() || !state.can_start() {
            return Err(ContainerError::invalid_state("start", state));
        }

        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|e| {
                ContainerError::configuration(format!("no tokio runtime available: {e}"))
            })?,
        };

        let config = &self.core.config;
        let generation = self.core.shared.begin_generation();
        self.core.metrics.set_generation(generation);

        let mut channels = Vec::with_capacity(config.concurrency);
        for slot in 0..config.concurrency {
            match self.core.open_channel(slot).await {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    error!(
                        queue = %config.queue_name,
                        slot,
                        error = %err,
                        "Channel acquisition failed, aborting start"
                    );
                    for mut channel in channels {
                        if let Err(close_err) = channel.close().await {
                            debug!(error = %close_err, "Failed to close channel");
                        }
                    }
                    self.core
                        .shared
                        .update_slot(generation, slot, |record| record.fail(err.to_string()));
                    return Err(err);
                }
            }
        }

        // shutdown() may have run while channels were being acquired
        if self.shutdown.is_cancelled() {
            for mut channel in channels {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Failed to close channel");
                }
            }
            return Err(ContainerError::invalid_state("start", LifecycleState::Shutdown));
        }

        let stop = CancellationToken::new();
        let kill = self.shutdown.child_token();
        let mut supervisor = Supervisor::new(
            self.core.clone(),
            generation,
            stop.clone(),
            kill.clone(),
            runtime.clone(),
        );
        for (slot, channel) in channels.into_iter().enumerate() {
            supervisor.spawn_worker(slot, channel);
        }

        let span = info_span!("listener_container", queue = %config.queue_name, generation);
        let handle = runtime.spawn(supervisor.run().instrument(span));

        *current = Some(Generation {
            id: generation,
            stop,
            kill,
            supervisor: handle,
        });
        self.transition(LifecycleState::Running);

        // A concurrent shutdown() is waiting on the lock and tears this generation down.
        if self.shutdown.is_cancelled() {
            return Err(ContainerError::invalid_state("start", LifecycleState::Shutdown));
        }

        info!(
            queue = %config.queue_name,
            generation,
            workers = self.core.shared.active_workers(),
            "Listener container started"
        );
        Ok(())
    }

    /// Stop consuming, letting in-flight deliveries settle.
    ///
    /// A no-op unless RUNNING. Waits up to the drain timeout; workers still
    /// busy after that are cancelled and `StopTimeout` is returned. The
    /// container is STOPPED in both cases.
    pub async fn stop(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        let Some(mut running) = current.take() else {
            return Ok(());
        };

        self.transition(LifecycleState::Stopping);
        running.stop.cancel();

        let config = &self.core.config;
        info!(queue = %config.queue_name, generation = running.id, "Stopping listener container");

        let drained = tokio::time::timeout(config.drain_timeout, &mut running.supervisor).await;
        let result = match drained {
            Ok(joined) => {
                if let Err(err) = joined {
                    warn!(error = %err, "Supervisor task ended abnormally");
                }
                Ok(())
            }
            Err(_) => {
                warn!(
                    queue = %config.queue_name,
                    timeout = ?config.drain_timeout,
                    "Workers did not drain in time, cancelling"
                );
                running.kill.cancel();
                if tokio::time::timeout(config.shutdown_timeout, &mut running.supervisor)
                    .await
                    .is_err()
                {
                    running.supervisor.abort();
                }
                Err(ContainerError::StopTimeout {
                    timeout: config.drain_timeout,
                })
            }
        };

        self.core.shared.clear_active(running.id);
        self.core.metrics.set_active_workers(0);
        self.transition(LifecycleState::Stopped);
        info!(queue = %config.queue_name, generation = running.id, "Listener container stopped");

        result
    }

    /// Cancel every worker without draining and release all resources.
    ///
    /// Valid from any state; the container can never be started again.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let previous = self.state.send_replace(LifecycleState::Shutdown);

        let mut current = self.current.lock().await;
        if let Some(mut running) = current.take() {
            running.stop.cancel();
            let timeout = self.core.config.shutdown_timeout;
            if tokio::time::timeout(timeout, &mut running.supervisor)
                .await
                .is_err()
            {
                warn!(?timeout, "Workers did not exit after cancellation, aborting");
                running.supervisor.abort();
            }
            self.core.shared.clear_active(running.id);
            self.core.metrics.set_active_workers(0);
        }

        if previous != LifecycleState::Shutdown {
            info!(queue = %self.core.config.queue_name, "Listener container shut down");
        }
    }

    /// Apply a lifecycle transition unless the container was shut down.
    fn transition(&self, next: LifecycleState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Lifecycle transition");
            *state = next;
            true
        });
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Receiver notified on every lifecycle transition
    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Current generation; 0 before the first start
    pub fn generation(&self) -> u64 {
        self.core.shared.generation()
    }

    /// Worker slots alive in the current generation
    pub fn active_workers(&self) -> usize {
        self.core.shared.active_workers()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.core.config
    }

    /// Last recorded error per slot
    pub fn last_errors(&self) -> Vec<(usize, String)> {
        self.core
            .shared
            .slots()
            .into_iter()
            .filter_map(|record| record.last_error.map(|error| (record.slot, error)))
            .collect()
    }

    /// Read-only view for monitoring
    pub fn snapshot(&self) -> ContainerSnapshot {
        let config = &self.core.config;
        ContainerSnapshot {
            queue: config.queue_name.clone(),
            state: self.state(),
            generation: self.generation(),
            concurrency: config.concurrency,
            active_workers: self.active_workers(),
            transactional: config.transactional,
            acknowledge_mode: config.acknowledge_mode,
            workers: self.core.shared.slots(),
        }
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        // Workers observe the cancellation and close their channels.
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenerError, listener_fn};
    use crate::memory::InMemoryBroker;
    use crate::state::WorkerStatus;
    use std::time::Duration;

    fn ok_listener() -> impl MessageListener<String> {
        listener_fn(|_: String, _| async move { Ok::<(), ListenerError>(()) })
    }

    fn container(broker: &InMemoryBroker, config: ContainerConfig) -> ListenerContainer {
        broker.declare_queue(config.queue_name.clone());
        ListenerContainer::new(
            Arc::new(broker.clone()),
            ListenerRegistration::new(config, ok_listener()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_settings() {
        let broker = InMemoryBroker::new();
        let provider: Arc<dyn ResourceProvider> = Arc::new(broker);
        assert!(register_listener(provider.clone(), "q", ok_listener(), 0, false).is_err());
        assert!(register_listener(provider.clone(), "", ok_listener(), 1, false).is_err());

        let container = register_listener(provider, "q", ok_listener(), 2, true).unwrap();
        assert_eq!(container.state(), LifecycleState::New);
        assert_eq!(container.generation(), 0);
        assert_eq!(container.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let broker = InMemoryBroker::new();
        let container = container(&broker, ContainerConfig::new("q").with_concurrency(3));

        container.start().await.unwrap();
        assert_eq!(container.state(), LifecycleState::Running);
        assert_eq!(container.active_workers(), 3);
        assert_eq!(broker.open_channels(), 3);
        let first = container.generation();

        container.stop().await.unwrap();
        assert_eq!(container.state(), LifecycleState::Stopped);
        assert_eq!(container.active_workers(), 0);
        assert_eq!(broker.open_channels(), 0);

        container.start().await.unwrap();
        assert!(container.generation() > first);
        assert_eq!(container.active_workers(), 3);

        container.shutdown().await;
        assert_eq!(container.state(), LifecycleState::Shutdown);
        assert_eq!(container.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let broker = InMemoryBroker::new();
        let container = container(&broker, ContainerConfig::new("q"));

        // stop before start is a no-op
        container.stop().await.unwrap();
        assert_eq!(container.state(), LifecycleState::New);

        container.start().await.unwrap();
        let err = container.start().await.unwrap_err();
        assert!(matches!(
            err,
            ContainerError::InvalidState {
                state: LifecycleState::Running,
                ..
            }
        ));
        assert_eq!(container.active_workers(), 1);

        container.stop().await.unwrap();
        container.stop().await.unwrap();

        container.shutdown().await;
        container.shutdown().await;
        assert!(container.start().await.is_err());
        assert_eq!(container.state(), LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn test_start_is_all_or_nothing() {
        let broker = InMemoryBroker::new();
        let container = container(&broker, ContainerConfig::new("q").with_concurrency(3));

        broker.fail_acquisitions_after(2, 1);
        let err = container.start().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(container.state(), LifecycleState::New);
        assert_eq!(container.active_workers(), 0);
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(container.last_errors().len(), 1);

        container.start().await.unwrap();
        assert_eq!(container.active_workers(), 3);
        container.shutdown().await;
    }

    /// Holds every acquisition until released.
    struct GatedProvider {
        broker: InMemoryBroker,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ResourceProvider for GatedProvider {
        async fn acquire_channel(&self) -> Result<Box<dyn crate::transport::Channel>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.broker.acquire_channel().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_start_fails_the_start() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q");
        let provider = Arc::new(GatedProvider {
            broker: broker.clone(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let container = Arc::new(
            ListenerContainer::new(
                provider.clone(),
                ListenerRegistration::new(ContainerConfig::new("q"), ok_listener()),
            )
            .unwrap(),
        );

        let starting = tokio::spawn({
            let container = container.clone();
            async move { container.start().await }
        });
        provider.entered.notified().await;

        let shutting_down = tokio::spawn({
            let container = container.clone();
            async move { container.shutdown().await }
        });
        while container.state() != LifecycleState::Shutdown {
            tokio::task::yield_now().await;
        }
        provider.release.notify_one();

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ContainerError::InvalidState {
                state: LifecycleState::Shutdown,
                ..
            }
        ));
        shutting_down.await.unwrap();
        assert_eq!(container.state(), LifecycleState::Shutdown);
        assert_eq!(container.active_workers(), 0);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let broker = InMemoryBroker::new();
        let container = container(&broker, ContainerConfig::new("q"));
        let mut changes = container.state_changes();

        container.start().await.unwrap();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), LifecycleState::Running);

        container.stop().await.unwrap();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_timeout_cancels_stuck_worker() {
        let broker = InMemoryBroker::new();
        broker.publish("slow", "stuck");
        let config = ContainerConfig::new("slow")
            .with_drain_timeout(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_millis(200));
        let container = ListenerContainer::new(
            Arc::new(broker.clone()),
            ListenerRegistration::new(
                config,
                listener_fn(|_: String, _| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }),
            ),
        )
        .unwrap();

        container.start().await.unwrap();
        while broker.unacked_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = container.stop().await.unwrap_err();
        assert!(matches!(err, ContainerError::StopTimeout { .. }));
        assert_eq!(container.state(), LifecycleState::Stopped);
        assert_eq!(broker.queue_depth("slow"), 1);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let broker = InMemoryBroker::new();
        let container = container(
            &broker,
            ContainerConfig::new("q").with_concurrency(2).with_transactional(true),
        );
        container.start().await.unwrap();

        let snapshot = container.snapshot();
        assert_eq!(snapshot.queue, "q");
        assert_eq!(snapshot.state, LifecycleState::Running);
        assert_eq!(snapshot.active_workers, 2);
        assert!(snapshot.transactional);
        assert_eq!(snapshot.workers.len(), 2);
        assert!(
            snapshot
                .workers
                .iter()
                .all(|w| w.status != WorkerStatus::Failed)
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "RUNNING");
        container.shutdown().await;
    }
}
