//! Shared test utilities for listener container tests
//!
//! - `RecordingListener`: counts invocations and distinct payloads, with
//!   optional latency and failure injection
//! - `TestDataBuilder`: deterministic queue names and message bodies
//! - `wait_for`: poll a condition with a deadline
//! - `init_test_tracing`: test-writer subscriber, safe to call from every test
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{RecordingListener, TestDataBuilder, wait_for};
//!
//! #[tokio::test]
//! async fn my_container_test() {
//!     let data = TestDataBuilder::from_test_name("my_container_test");
//!     let listener = RecordingListener::new();
//!     // register listener.clone() on data.queue("main"), publish data.messages(10) ...
//!     assert!(wait_for(Duration::from_secs(5), || listener.distinct() == 10).await);
//! }
//! ```

use async_trait::async_trait;
use listener_container::{ListenerError, MessageContext, MessageListener};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Install a tracing subscriber that writes through the test harness.
///
/// Honours `RUST_LOG`; repeated calls are ignored.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,listener_container=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(?timeout, "Condition not met before the deadline");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// When a [`RecordingListener`] fails a message.
#[derive(Debug, Clone, Default)]
pub enum FailureMode {
    #[default]
    Never,
    /// Every message fails with a transient error
    Always,
    /// Messages whose body equals the given payload fail
    Payload(String),
    /// The first delivery of every message fails; redeliveries succeed
    FirstDelivery,
    /// Every message fails with a fatal error
    Fatal,
}

struct RecordingState {
    invocations: AtomicUsize,
    successes: AtomicUsize,
    seen: Mutex<HashSet<String>>,
    redeliveries: AtomicUsize,
    delay: Option<Duration>,
    failure: FailureMode,
}

impl RecordingState {
    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listener that records what it was handed.
#[derive(Clone)]
pub struct RecordingListener {
    state: Arc<RecordingState>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::build(None, FailureMode::Never)
    }

    fn build(delay: Option<Duration>, failure: FailureMode) -> Self {
        Self {
            state: Arc::new(RecordingState {
                invocations: AtomicUsize::new(0),
                successes: AtomicUsize::new(0),
                seen: Mutex::new(HashSet::new()),
                redeliveries: AtomicUsize::new(0),
                delay,
                failure,
            }),
        }
    }

    /// Sleep for `delay` inside every invocation
    pub fn with_delay(self, delay: Duration) -> Self {
        Self::build(Some(delay), self.state.failure.clone())
    }

    /// Fail messages according to `failure`
    pub fn with_failure(self, failure: FailureMode) -> Self {
        Self::build(self.state.delay, failure)
    }

    /// Times the listener was called
    pub fn invocations(&self) -> usize {
        self.state.invocations.load(Ordering::SeqCst)
    }

    /// Calls that returned `Ok`
    pub fn successes(&self) -> usize {
        self.state.successes.load(Ordering::SeqCst)
    }

    /// Distinct payloads processed successfully
    pub fn distinct(&self) -> usize {
        self.state.seen().len()
    }

    /// Calls for deliveries flagged as redelivered
    pub fn redeliveries(&self) -> usize {
        self.state.redeliveries.load(Ordering::SeqCst)
    }

    pub fn has_seen(&self, payload: &str) -> bool {
        self.state.seen().contains(payload)
    }
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageListener<String> for RecordingListener {
    async fn on_message(&self, payload: String, ctx: &MessageContext) -> Result<(), ListenerError> {
        let state = &self.state;
        state.invocations.fetch_add(1, Ordering::SeqCst);
        if ctx.redelivered {
            state.redeliveries.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(delay) = state.delay {
            tokio::time::sleep(delay).await;
        }

        match &state.failure {
            FailureMode::Always => return Err(ListenerError::transient("always fails")),
            FailureMode::Payload(body) if *body == payload => {
                return Err(ListenerError::transient(format!("refusing '{payload}'")));
            }
            FailureMode::FirstDelivery if !ctx.redelivered => {
                return Err(ListenerError::transient("first delivery fails"));
            }
            FailureMode::Fatal => return Err(ListenerError::fatal("listener cannot continue")),
            _ => {}
        }

        state.successes.fetch_add(1, Ordering::SeqCst);
        debug!(slot = ctx.slot, delivery_tag = ctx.delivery_tag, %payload, "Recorded message");
        state.seen().insert(payload);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording_listener"
    }
}

/// Builder for test data with deterministic names
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is a hash of the name)
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue name unique to this test
    pub fn queue(&self, suffix: &str) -> String {
        format!("test-{}-{}", self.seed, suffix)
    }

    /// `count` distinct message bodies
    pub fn messages(&self, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("msg-{}-{i}", self.seed)).collect()
    }

    /// Deterministic message id for the `index`-th message
    pub fn message_id(&self, index: u64) -> Uuid {
        Uuid::from_u64_pair(self.seed, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listener_container::Delivery;

    fn context(redelivered: bool) -> MessageContext {
        let delivery = Delivery::new(1, "q", Vec::new()).with_redelivered(redelivered);
        MessageContext {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            delivery_count: delivery.delivery_count,
            queue: delivery.queue,
            message_id: None,
            received_at: delivery.received_at,
            slot: 0,
        }
    }

    #[tokio::test]
    async fn test_recording_listener_counts() {
        let listener = RecordingListener::new();
        listener.on_message("a".into(), &context(false)).await.unwrap();
        listener.on_message("a".into(), &context(true)).await.unwrap();

        assert_eq!(listener.invocations(), 2);
        assert_eq!(listener.successes(), 2);
        assert_eq!(listener.distinct(), 1);
        assert_eq!(listener.redeliveries(), 1);
        assert!(listener.has_seen("a"));
    }

    #[tokio::test]
    async fn test_failure_modes() {
        let listener = RecordingListener::new().with_failure(FailureMode::FirstDelivery);
        assert!(listener.on_message("a".into(), &context(false)).await.is_err());
        assert!(listener.on_message("a".into(), &context(true)).await.is_ok());

        let listener = RecordingListener::new().with_failure(FailureMode::Payload("bad".into()));
        assert!(listener.on_message("bad".into(), &context(false)).await.is_err());
        assert!(listener.on_message("good".into(), &context(false)).await.is_ok());
        assert_eq!(listener.distinct(), 1);
    }

    #[tokio::test]
    async fn test_wait_for() {
        init_test_tracing();
        assert!(wait_for(Duration::from_millis(10), || true).await);
        assert!(!wait_for(Duration::from_millis(20), || false).await);
    }

    #[test]
    fn test_data_builder_deterministic() {
        let a = TestDataBuilder::from_test_name("my_test");
        let b = TestDataBuilder::from_test_name("my_test");
        let c = TestDataBuilder::from_test_name("other_test");

        assert_eq!(a.queue("main"), b.queue("main"));
        assert_ne!(a.queue("main"), c.queue("main"));
        assert_eq!(a.messages(3).len(), 3);
        assert_eq!(a.message_id(1), b.message_id(1));
    }
}
