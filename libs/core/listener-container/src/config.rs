//! Container configuration
//!
//! `ContainerConfig` carries everything a registration needs besides the
//! listener itself. It can be built in code or loaded from `LISTENER_*`
//! environment variables.

use core_config::{ConfigError, FromEnv, env_parse, env_parse_or, env_required};
use serde::Serialize;
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::{ContainerError, Result};

/// How deliveries are settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgeMode {
    /// The container settles each delivery after the listener returns.
    #[default]
    Auto,
    /// The broker considers a delivery settled as soon as it is sent.
    ///
    /// Deliveries buffered or in flight when a worker stops are lost.
    None,
}

impl AcknowledgeMode {
    /// Whether the container owes the broker a disposition per delivery.
    pub fn settles_after_processing(&self) -> bool {
        matches!(self, AcknowledgeMode::Auto)
    }
}

/// Configuration for a listener container
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Queue to consume from
    pub queue_name: String,

    /// Number of concurrent consumer workers
    pub concurrency: usize,

    /// Settle deliveries inside channel transactions
    pub transactional: bool,

    /// Settlement mode
    pub acknowledge_mode: AcknowledgeMode,

    /// Unsettled deliveries the broker may push to one worker
    pub prefetch_count: u16,

    /// Per-message handler timeout (None = unbounded)
    pub receive_timeout: Option<Duration>,

    /// Bounded wait for in-flight deliveries on stop
    pub drain_timeout: Duration,

    /// Bounded wait for cancelled workers on shutdown
    pub shutdown_timeout: Duration,

    /// Delay before a failed worker slot is recreated (None = wait for next start)
    pub recovery_interval: Option<Duration>,

    /// Prefix for consumer tags, suffixed with the slot number
    pub consumer_tag_prefix: String,
}

impl ContainerConfig {
    /// Create a configuration for `queue_name` with default settings
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: 1,
            transactional: false,
            acknowledge_mode: AcknowledgeMode::Auto,
            prefetch_count: 1,
            receive_timeout: None,
            drain_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
            recovery_interval: Some(Duration::from_secs(5)),
            consumer_tag_prefix: format!("listener-{}", Uuid::new_v4()),
        }
    }

    /// Set the number of concurrent consumers
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enable or disable transactional settlement
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Set the acknowledge mode
    pub fn with_acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    /// Set the prefetch count
    pub fn with_prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch;
        self
    }

    /// Set the per-message timeout
    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the bounded drain wait used by stop
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the bounded wait used by shutdown
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the recovery interval for failed workers
    pub fn with_recovery_interval(mut self, interval: Option<Duration>) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Set the consumer tag prefix
    pub fn with_consumer_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_tag_prefix = prefix.into();
        self
    }

    /// Consumer tag for a worker slot
    pub fn consumer_tag(&self, slot: usize) -> String {
        format!("{}-{}", self.consumer_tag_prefix, slot)
    }

    /// Check that the configuration can run.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(ContainerError::configuration("queue name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(ContainerError::configuration(
                "concurrency must be at least 1",
            ));
        }
        if self.prefetch_count == 0 {
            return Err(ContainerError::configuration(
                "prefetch count must be at least 1",
            ));
        }
        if self.transactional && !self.acknowledge_mode.settles_after_processing() {
            return Err(ContainerError::configuration(
                "transactional containers require acknowledge mode 'auto'",
            ));
        }
        Ok(())
    }
}

impl FromEnv for ContainerConfig {
    /// Requires LISTENER_QUEUE; every other setting falls back to its default
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_required("LISTENER_QUEUE")?);

        config.concurrency = env_parse_or("LISTENER_CONCURRENCY", config.concurrency)?;
        config.transactional = env_parse_or("LISTENER_TRANSACTIONAL", config.transactional)?;
        config.acknowledge_mode = env_parse_or("LISTENER_ACK_MODE", config.acknowledge_mode)?;
        config.prefetch_count = env_parse_or("LISTENER_PREFETCH", config.prefetch_count)?;

        if let Some(ms) = env_parse::<u64>("LISTENER_RECEIVE_TIMEOUT_MS")? {
            config.receive_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("LISTENER_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout = Duration::from_millis(ms);
        }
        // 0 disables automatic recovery
        if let Some(ms) = env_parse::<u64>("LISTENER_RECOVERY_INTERVAL_MS")? {
            config.recovery_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::new("listener.queue")
    }
}
