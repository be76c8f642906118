//! Listener trait and the errors it reports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::marker::PhantomData;
use strum::Display;
use thiserror::Error;

use crate::delivery::Delivery;
use crate::payload::FromPayload;

/// Error categories decide what happens to the delivery.
///
/// - **Transient**: requeued until the redelivery threshold, then discarded
/// - **Permanent**: discarded immediately (dead-lettered when a sink is set)
/// - **Fatal**: discarded and the worker's channel is recycled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Fatal,
}

/// Error returned by a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Temporary failure, worth another attempt
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The message can never be processed
    #[error("permanent error: {message}")]
    Permanent { message: String },

    /// The worker cannot continue on its current channel
    #[error("fatal error: {message}")]
    Fatal { message: String },
}

impl ListenerError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient error with a source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Create a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Permanent,
            Self::Fatal { .. } => ErrorCategory::Fatal,
        }
    }
}

impl From<eyre::Report> for ListenerError {
    fn from(report: eyre::Report) -> Self {
        Self::transient(format!("{report:#}"))
    }
}

/// Metadata about the delivery being processed.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub delivery_count: u32,
    pub queue: String,
    pub message_id: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Worker slot handling the delivery
    pub slot: usize,
}

impl MessageContext {
    pub(crate) fn new(delivery: &Delivery, slot: usize) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            delivery_count: delivery.delivery_count,
            queue: delivery.queue.clone(),
            message_id: delivery.message_id.clone(),
            received_at: delivery.received_at,
            slot,
        }
    }
}

/// Message listener.
///
/// Implement this trait to handle messages from a queue. The payload type is
/// decoded before the call through [`FromPayload`].
///
/// # Example
///
/// ```rust,ignore
/// use listener_container::{Json, ListenerError, MessageContext, MessageListener};
///
/// struct InvoiceListener {
///     store: Arc<InvoiceStore>,
/// }
///
/// #[async_trait]
/// impl MessageListener<Json<Invoice>> for InvoiceListener {
///     async fn on_message(&self, invoice: Json<Invoice>, ctx: &MessageContext) -> Result<(), ListenerError> {
///         self.store.save(&invoice).await
///             .map_err(|e| ListenerError::transient_with_source("store unavailable", e))
///     }
///
///     fn name(&self) -> &'static str {
///         "invoice_listener"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageListener<P: FromPayload>: Send + Sync + 'static {
    /// Handle one message.
    ///
    /// * `Ok(())` - the delivery is acknowledged
    /// * `Err(ListenerError)` - the requeue policy decides by category
    async fn on_message(&self, payload: P, ctx: &MessageContext) -> Result<(), ListenerError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str {
        "listener"
    }
}

/// Listener backed by an async closure, see [`listener_fn`].
pub struct FnListener<P, F> {
    name: &'static str,
    handler: F,
    _payload: PhantomData<fn() -> P>,
}

impl<P, F> FnListener<P, F> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Wrap an async closure as a [`MessageListener`].
///
/// ```rust,ignore
/// let listener = listener_fn(|body: String, _ctx| async move {
///     tracing::info!(%body, "received");
///     Ok(())
/// });
/// ```
pub fn listener_fn<P, F, Fut>(handler: F) -> FnListener<P, F>
where
    P: FromPayload,
    F: Fn(P, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    FnListener {
        name: "fn_listener",
        handler,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> MessageListener<P> for FnListener<P, F>
where
    P: FromPayload,
    F: Fn(P, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    async fn on_message(&self, payload: P, ctx: &MessageContext) -> Result<(), ListenerError> {
        (self.handler)(payload, ctx.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
