//! One-shot completion signals between callbacks and `start`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::InstanceId;
use tokio::sync::oneshot;

use crate::error::SagaError;

/// How an instance started by this process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    RolledBack,
}

#[derive(Debug)]
enum Slot {
    Waiting(oneshot::Sender<Outcome>),
    Signalled(Outcome),
}

/// Completion signals keyed by instance id.
///
/// Each instance gets exactly one signal. The waiter is registered before
/// perform runs, so a callback that finishes first still finds it.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    slots: Mutex<HashMap<InstanceId, Slot>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `instance` and returns its receiving end.
    pub fn register(&self, instance: InstanceId) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(instance, Slot::Waiting(tx));
        rx
    }

    /// Delivers `outcome` to the waiter of `instance`.
    ///
    /// Returns `Ok(false)` when no waiter was registered here, which is the
    /// case for instances started by a parent in another process. A second
    /// signal for the same instance is an error.
    pub fn resolve(&self, instance: InstanceId, outcome: Outcome) -> Result<bool, SagaError> {
        let mut slots = self.lock();
        match slots.remove(&instance) {
            Some(Slot::Waiting(tx)) => {
                // The receiver may already be gone if `start` gave up.
                let _ = tx.send(outcome);
                slots.insert(instance, Slot::Signalled(outcome));
                Ok(true)
            }
            Some(Slot::Signalled(previous)) => {
                slots.insert(instance, Slot::Signalled(previous));
                Err(SagaError::CompletionAlreadySignalled(instance))
            }
            None => Ok(false),
        }
    }

    /// Drops the waiter of `instance` without signalling it.
    pub fn discard(&self, instance: InstanceId) {
        self.lock().remove(&instance);
    }

    /// Returns true if a waiter is registered and not yet signalled.
    pub fn is_waiting(&self, instance: InstanceId) -> bool {
        matches!(self.lock().get(&instance), Some(Slot::Waiting(_)))
    }
}
