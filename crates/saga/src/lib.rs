//! Choreographed saga coordination.
//!
//! Every participant service runs its own [`TransactionCoordinator`] for the
//! one action it owns. Coordinators never call each other: they learn about
//! peers only through lifecycle events published on a
//! [`CommunicationProvider`](providers::CommunicationProvider) and through
//! counters and flags kept in a shared
//! [`StorageProvider`](providers::StorageProvider).
//!
//! An action may name a parent (its perform step runs when the parent
//! announces Started, and it rolls back when the parent announces Aborted)
//! and a list of sibling dependencies (it only succeeds once every dependency
//! has reported, and rolls back if any of them failed).
//!
//! Instances move through the states of [`ActionState`]; a parent abort can
//! still roll back an instance that already succeeded.

pub mod action;
pub mod completion;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod keys;
pub mod recording;
pub mod state;
pub mod topics;

pub use action::{Action, ActionDescriptor, ActionDescriptorBuilder, ActionError, FnAction};
pub use completion::{CompletionRegistry, Outcome};
pub use coordinator::TransactionCoordinator;
pub use error::{Result, SagaError};
pub use events::{LifecycleEvent, LifecycleMessage};
pub use keys::{STATUS_FAILED, StorageKeys};
pub use recording::RecordingAction;
pub use state::ActionState;
pub use topics::{CommunicationTopics, Subscription};
