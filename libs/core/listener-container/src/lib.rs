//! Listener Container
//!
//! A concurrent message listener container: register a listener on a queue and
//! the container supervises N consumer workers that receive, dispatch and settle
//! deliveries through a pluggable transport.
//!
//! ## Features
//!
//! - **Managed lifecycle**: `NEW → RUNNING → STOPPING → STOPPED`, restartable,
//!   with a terminal `SHUTDOWN`
//! - **Drain on stop**: in-flight deliveries finish their disposition before
//!   channels close
//! - **Transactional settlement**: acknowledgments commit after processing,
//!   so nothing is lost across stop/start cycles
//! - **Requeue policy**: failed deliveries are retried up to a threshold and
//!   then discarded, optionally through a dead-letter sink
//! - **Supervision**: fatal deliveries and transport failures recycle the
//!   affected slot only
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use listener_container::{
//!     ContainerConfig, InMemoryBroker, ListenerContainer, ListenerRegistration, listener_fn,
//! };
//!
//! let broker = InMemoryBroker::new();
//! broker.declare_queue("orders");
//!
//! let listener = listener_fn(|body: String, ctx| async move {
//!     tracing::info!(slot = ctx.slot, %body, "order received");
//!     Ok(())
//! });
//!
//! let config = ContainerConfig::new("orders")
//!     .with_concurrency(4)
//!     .with_transactional(true);
//! let container = ListenerContainer::new(
//!     Arc::new(broker),
//!     ListenerRegistration::new(config, listener),
//! )?;
//!
//! container.start().await?;
//! // ...
//! container.stop().await?;
//! container.shutdown().await;
//! ```

mod config;
mod container;
mod dead_letter;
mod delivery;
mod dispatcher;
mod error;
mod health;
mod listener;
pub mod memory;
pub mod metrics;
mod payload;
mod policy;
mod state;
mod supervisor;
mod transport;
mod worker;

// Re-export main types
pub use config::{AcknowledgeMode, ContainerConfig};
pub use container::{ListenerContainer, ListenerRegistration, register_listener};
pub use dead_letter::{DeadLetterEntry, DeadLetterSink, DeadLetterStats, InMemoryDeadLetterQueue};
pub use delivery::{Delivery, DeliveryTracker};
pub use dispatcher::{Dispatch, Dispatcher, Outcome};
pub use error::{ContainerError, Result};
pub use health::{HealthState, health_router};
pub use listener::{ErrorCategory, FnListener, ListenerError, MessageContext, MessageListener, listener_fn};
pub use memory::{InMemoryBroker, InMemoryChannel};
pub use metrics::{ContainerMetrics, init_metrics};
pub use payload::{ConversionError, FromPayload, Json};
pub use policy::{DefaultRequeuePolicy, Disposition, RejectAndDontRequeuePolicy, RequeuePolicy};
pub use state::{ContainerSnapshot, LifecycleState, SlotRecord, WorkerStatus};
pub use transport::{Channel, ConsumeOptions, ResourceProvider};
