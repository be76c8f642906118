//! Message dispatcher
//!
//! Decodes the delivery body, invokes the listener on the calling worker task
//! and folds every way the call can end into an [`Outcome`]. Nothing raised by
//! the listener escapes `dispatch`.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, debug_span, warn};

use crate::delivery::Delivery;
use crate::listener::{ErrorCategory, MessageContext, MessageListener};
use crate::payload::FromPayload;

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The listener failed or panicked; the message may succeed on retry.
    HandlerFailure(String),
    /// The message can never be processed (undecodable or permanently refused).
    Rejected(String),
    /// Non-recoverable for the worker; its channel is recycled.
    Fatal(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Whether the worker must restart on a fresh channel after settling.
    pub fn requires_restart(&self) -> bool {
        matches!(self, Outcome::Fatal(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::HandlerFailure(reason) | Outcome::Rejected(reason) | Outcome::Fatal(reason) => {
                Some(reason)
            }
        }
    }

    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::HandlerFailure(_) => "handler_failure",
            Outcome::Rejected(_) => "rejected",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// Type-erased dispatch used by workers.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, delivery: &Delivery, slot: usize) -> Outcome;

    fn listener_name(&self) -> &'static str;
}

/// Binds a listener to its payload type and the per-message timeout.
pub struct Dispatcher<P, L> {
    listener: Arc<L>,
    receive_timeout: Option<Duration>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, L> Dispatcher<P, L>
where
    P: FromPayload,
    L: MessageListener<P>,
{
    pub fn new(listener: L) -> Self {
        Self::from_arc(Arc::new(listener))
    }

    pub fn from_arc(listener: Arc<L>) -> Self {
        Self {
            listener,
            receive_timeout: None,
            _payload: PhantomData,
        }
    }

    /// Cancel the listener call and report `Fatal` once `timeout` elapses
    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    async fn invoke(&self, payload: P, ctx: &MessageContext) -> Outcome {
        let call = AssertUnwindSafe(self.listener.on_message(payload, ctx)).catch_unwind();

        let result = match self.receive_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Outcome::Fatal(format!(
                        "listener '{}' exceeded receive timeout of {limit:?}",
                        self.listener.name()
                    ));
                }
            },
            None => call.await,
        };

        match result {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(err)) => match err.category() {
                ErrorCategory::Transient => Outcome::HandlerFailure(err.to_string()),
                ErrorCategory::Permanent => Outcome::Rejected(err.to_string()),
                ErrorCategory::Fatal => Outcome::Fatal(err.to_string()),
            },
            Err(panic) => Outcome::HandlerFailure(format!(
                "listener panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }
}

#[async_trait]
impl<P, L> Dispatch for Dispatcher<P, L>
where
    P: FromPayload,
    L: MessageListener<P>,
{
    async fn dispatch(&self, delivery: &Delivery, slot: usize) -> Outcome {
        let span = debug_span!(
            "dispatch",
            listener = self.listener.name(),
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
        );

        async {
            let payload = match P::from_payload(&delivery.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "Failed to convert payload");
                    return Outcome::Rejected(format!("payload conversion failed: {err}"));
                }
            };

            let ctx = MessageContext::new(delivery, slot);
            let outcome = self.invoke(payload, &ctx).await;
            debug!(outcome = outcome.label(), "Dispatch finished");
            outcome
        }
        .instrument(span)
        .await
    }

    fn listener_name(&self) -> &'static str {
        self.listener.name()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
