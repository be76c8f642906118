//! Prometheus metrics for listener containers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

use crate::dispatcher::Outcome;
use crate::policy::Disposition;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Applications opt in by calling this once at startup; later calls return the
/// existing handle. Fails if another recorder was installed first.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Per-container metrics helper
#[derive(Clone)]
pub struct ContainerMetrics {
    queue: String,
}

impl ContainerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery handed to a worker
    pub fn delivery_received(&self, redelivered: bool) {
        counter!(
            "listener_container_deliveries_received_total",
            "queue" => self.queue.clone(),
            "redelivered" => if redelivered { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record a finished dispatch
    pub fn delivery_dispatched(&self, outcome: &Outcome, duration: Duration) {
        counter!(
            "listener_container_dispatch_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);

        histogram!(
            "listener_container_dispatch_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record the disposition issued for a delivery
    pub fn delivery_settled(&self, disposition: Disposition) {
        counter!(
            "listener_container_dispositions_total",
            "queue" => self.queue.clone(),
            "disposition" => disposition.to_string()
        )
        .increment(1);
    }

    /// Record a dead-lettered delivery
    pub fn dead_lettered(&self) {
        counter!(
            "listener_container_dead_letters_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a worker slot being recreated
    pub fn worker_restarted(&self, reason: &'static str) {
        counter!(
            "listener_container_worker_restarts_total",
            "queue" => self.queue.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a worker exiting on a transport error
    pub fn worker_failed(&self) {
        counter!(
            "listener_container_worker_failures_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Set the number of live workers
    pub fn set_active_workers(&self, count: usize) {
        gauge!(
            "listener_container_active_workers",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }

    /// Set the current generation
    pub fn set_generation(&self, generation: u64) {
        gauge!(
            "listener_container_generation",
            "queue" => self.queue.clone()
        )
        .set(generation as f64);
    }
}
