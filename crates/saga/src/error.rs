//! Saga error types.

use common::InstanceId;
use providers::ProviderError;
use thiserror::Error;

use crate::action::ActionError;
use crate::state::ActionState;

/// Errors that can occur during saga coordination.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The action descriptor is malformed.
    #[error("Invalid action descriptor: {0}")]
    InvalidDescriptor(String),

    /// `start` or a callback ran before `initialize`.
    #[error("Coordinator is not initialized")]
    NotInitialized,

    /// `initialize` was called twice.
    #[error("Coordinator is already initialized")]
    AlreadyInitialized,

    /// `start` was called twice.
    #[error("Action has already been started")]
    AlreadyStarted,

    /// An instance is in the wrong state for the requested transition.
    #[error("Invalid state transition for instance {instance}: {from} -> {to}")]
    InvalidState {
        instance: InstanceId,
        from: ActionState,
        to: ActionState,
    },

    /// A completion signal was written a second time.
    #[error("Completion for instance {0} was already signalled")]
    CompletionAlreadySignalled(InstanceId),

    /// The completion signal was dropped without an outcome.
    #[error("Completion for instance {0} was lost")]
    CompletionLost(InstanceId),

    /// The instance rolled back.
    #[error("Instance {0} rolled back")]
    RolledBack(InstanceId),

    /// The single opaque failure reported to callers of `start`.
    #[error("Action '{action}' failed: {reason}")]
    ActionFailed { action: String, reason: String },

    /// The user perform callback failed.
    #[error("Perform failed: {0}")]
    Perform(#[from] ActionError),

    /// Storage or communication provider error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
