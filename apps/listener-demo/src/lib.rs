//! Listener Demo
//!
//! Runs an order listener container against the in-memory broker:
//! publishes a batch of orders, consumes them with a concurrent container,
//! cycles the container through stop/start halfway, and serves the health
//! and admin endpoints until the queue is drained or a signal arrives.

use async_trait::async_trait;
use axum::Router;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{ConfigError, Environment, FromEnv, env_parse_or};
use eyre::{Result, WrapErr};
use listener_container::{
    ContainerConfig, DeadLetterSink, HealthState, InMemoryBroker, InMemoryDeadLetterQueue, Json,
    ListenerContainer, ListenerError, ListenerRegistration, MessageContext, MessageListener,
    health_router, init_metrics,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_QUEUE: &str = "demo.orders";

/// Demo settings, loaded from `DEMO_*` and `HEALTH_PORT`
#[derive(Debug, Clone)]
pub struct DemoSettings {
    pub messages: usize,
    pub health_port: u16,
    /// Processed count after which the container is stopped and restarted
    pub restart_after: u64,
    /// Exit once every message has been settled instead of waiting for a signal
    pub exit_when_drained: bool,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            messages: 200,
            health_port: 8081,
            restart_after: 50,
            exit_when_drained: true,
        }
    }
}

impl FromEnv for DemoSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            messages: env_parse_or("DEMO_MESSAGES", defaults.messages)?,
            health_port: env_parse_or("HEALTH_PORT", defaults.health_port)?,
            restart_after: env_parse_or("DEMO_RESTART_AFTER", defaults.restart_after)?,
            exit_when_drained: env_parse_or("DEMO_EXIT_WHEN_DRAINED", defaults.exit_when_drained)?,
        })
    }
}

/// Load the container configuration, defaulting the queue when `LISTENER_QUEUE` is unset.
pub fn container_config() -> Result<ContainerConfig> {
    match ContainerConfig::from_env() {
        Ok(config) => Ok(config),
        Err(ConfigError::MissingEnvVar(_)) => Ok(ContainerConfig::new(DEFAULT_QUEUE)
            .with_concurrency(4)
            .with_transactional(true)
            .with_recovery_interval(Some(Duration::from_secs(1)))),
        Err(err) => Err(err).wrap_err("Failed to load listener configuration"),
    }
}

/// Order event carried by the demo queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: u64,
    pub customer: String,
    pub amount_cents: i64,
}

/// Listener that "processes" orders and rejects negative amounts.
#[derive(Default)]
pub struct OrderListener {
    processed: AtomicU64,
    rejected: AtomicU64,
}

impl OrderListener {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageListener<Json<OrderEvent>> for OrderListener {
    async fn on_message(
        &self,
        order: Json<OrderEvent>,
        ctx: &MessageContext,
    ) -> Result<(), ListenerError> {
        if order.amount_cents < 0 {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ListenerError::permanent(format!(
                "order {} has a negative amount",
                order.order_id
            )));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        self.processed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            order_id = order.order_id,
            customer = %order.customer,
            slot = ctx.slot,
            redelivered = ctx.redelivered,
            "Order processed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "order_listener"
    }
}

/// Publish `count` orders; every 25th carries a negative amount.
pub fn publish_orders(broker: &InMemoryBroker, queue: &str, count: usize) -> Result<()> {
    for i in 0..count as u64 {
        let order = OrderEvent {
            order_id: i,
            customer: format!("customer-{}", i % 7),
            amount_cents: if i % 25 == 24 { -100 } else { 1_000 + i as i64 },
        };
        let payload = serde_json::to_vec(&order).wrap_err("Failed to encode order")?;
        broker.publish_with_id(queue, format!("order-{i}"), payload);
    }
    Ok(())
}

pub async fn run() -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
    }

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting listener demo"
    );

    let settings = DemoSettings::from_env().wrap_err("Failed to load demo settings")?;
    let config = container_config()?;
    let queue = config.queue_name.clone();

    let broker = InMemoryBroker::new();
    broker.declare_queue(queue.clone());
    publish_orders(&broker, &queue, settings.messages)?;
    info!(queue = %queue, messages = settings.messages, "Orders published");

    let listener = Arc::new(OrderListener::default());
    let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
    let registration = ListenerRegistration::from_arc(config, listener.clone())
        .with_dead_letter_sink(dead_letters.clone() as Arc<dyn DeadLetterSink>);
    let container = Arc::new(
        ListenerContainer::new(Arc::new(broker.clone()), registration)
            .wrap_err("Failed to create listener container")?,
    );

    let health_state = HealthState::new(
        container.clone(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
    .with_dead_letters(dead_letters.clone());
    let port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_router(health_state), port).await {
            error!(error = %e, "Health server failed");
        }
    });

    container.start().await.wrap_err("Failed to start container")?;

    let exchange = async {
        let restart_after = settings.restart_after.min(settings.messages as u64);
        wait_until(|| listener.processed() + listener.rejected() >= restart_after).await;
        info!(processed = listener.processed(), "Cycling container");
        container.stop().await.wrap_err("Failed to stop container")?;
        container.start().await.wrap_err("Failed to restart container")?;

        if settings.exit_when_drained {
            wait_until(|| broker.queue_depth(&queue) == 0 && broker.unacked_count() == 0).await;
            info!("Queue drained");
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<_, eyre::Report>(())
    };

    tokio::select! {
        result = exchange => result?,
        result = shutdown_signal() => {
            if let Err(e) = result {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }

    if let Err(e) = container.stop().await {
        warn!(error = %e, "Container did not stop cleanly");
    }
    container.shutdown().await;

    info!(
        processed = listener.processed(),
        rejected = listener.rejected(),
        dead_letters = dead_letters.len(),
        generation = container.generation(),
        "Listener demo finished"
    );
    Ok(())
}

async fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Serve `router` on all interfaces.
async fn start_health_server(router: Router, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {addr}"))?;

    info!("Health server listening on {}", addr);
    axum::serve(listener, router)
        .await
        .wrap_err("Health server failed")?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        term.recv().await;
        Ok::<_, eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}
