//! Container error types
//!
//! Errors are split by who can act on them:
//! - **Lifecycle misuse**: an operation was called from a state that does not allow it
//! - **Transport**: the channel or connection failed; the affected worker stops
//! - **Disposition violation**: a delivery was settled twice, a programming error
//! - **Configuration**: the registration can never run as described

use crate::state::LifecycleState;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the container.
pub type Result<T, E = ContainerError> = std::result::Result<T, E>;

/// Listener container errors
#[derive(Error, Debug, Clone)]
pub enum ContainerError {
    /// Lifecycle operation invoked from a state that does not permit it
    #[error("cannot {operation} container in state {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// Invalid registration or container settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Channel or connection failure reported by the resource provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// A delivery received a second terminal disposition (or none was owed)
    #[error("Disposition violation for delivery {delivery_tag}: {reason}")]
    DispositionViolation { delivery_tag: u64, reason: String },

    /// Workers did not drain within the bounded stop wait
    #[error("Workers did not stop within {timeout:?}")]
    StopTimeout { timeout: Duration },
}

impl ContainerError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        ContainerError::Transport(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        ContainerError::Configuration(message.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(operation: &'static str, state: LifecycleState) -> Self {
        ContainerError::InvalidState { operation, state }
    }

    /// Whether the error means the worker lost its channel
    pub fn is_transport(&self) -> bool {
        matches!(self, ContainerError::Transport(_))
    }
}
