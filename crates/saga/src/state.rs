//! Action instance state machine.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::InstanceId;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The state of one action instance as seen by its own coordinator.
///
/// State transitions:
/// ```text
/// Idle ──► Executing ──┬──► AwaitingDependencies ──┬──► Succeeded ──┐
///                      ├──► Succeeded              │                │
///                      ├──► RollingBack ◄──────────┴────────────────┘
///                      └──► Failed                      │
///                                      RollingBack ──► Failed
/// ```
///
/// `Succeeded → RollingBack` happens when a parent aborts after this
/// instance already completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ActionState {
    /// Nothing has happened for this instance yet.
    #[default]
    Idle,

    /// The perform step is running.
    Executing,

    /// Performed and announced; waiting for dependencies to report.
    AwaitingDependencies,

    /// Compensation is in progress.
    RollingBack,

    /// The instance and its dependencies completed (terminal unless the
    /// parent aborts).
    Succeeded,

    /// Perform failed or rollback finished (terminal state).
    Failed,
}

impl ActionState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Idle, Executing)
                | (Executing, AwaitingDependencies)
                | (Executing, Succeeded)
                | (Executing, RollingBack)
                | (Executing, Failed)
                | (AwaitingDependencies, Succeeded)
                | (AwaitingDependencies, RollingBack)
                | (Succeeded, RollingBack)
                | (RollingBack, Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Succeeded | ActionState::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Idle => "Idle",
            ActionState::Executing => "Executing",
            ActionState::AwaitingDependencies => "AwaitingDependencies",
            ActionState::RollingBack => "RollingBack",
            ActionState::Succeeded => "Succeeded",
            ActionState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a fired gate should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Read the status key: roll back if it is marked failed, else succeed.
    ReadStatus,
    /// Roll back regardless of the status key.
    RollBack,
}

impl Verdict {
    fn merge(self, other: Verdict) -> Verdict {
        if self == Verdict::RollBack || other == Verdict::RollBack {
            Verdict::RollBack
        } else {
            Verdict::ReadStatus
        }
    }
}

/// What the perform step does once its result is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settle {
    /// Wait for the dependency gate.
    Await,
    /// Settle right away.
    Now(Verdict),
}

/// What a fired gate does right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateDecision {
    /// Perform has not finished; it will settle the gate itself.
    Deferred,
    /// Settle now.
    Decide,
    /// The instance is already rolling back or failed.
    Settled,
}

#[derive(Debug, Default)]
struct InstanceEntry {
    state: ActionState,
    pending_gate: Option<Verdict>,
}

/// Per-instance states of one coordinator.
///
/// Event callbacks for one instance can overlap with each other and with the
/// perform step. The table arbitrates the hand-off between them so that each
/// instance settles exactly once in this process.
#[derive(Debug, Default)]
pub(crate) struct InstanceTable {
    entries: Mutex<HashMap<InstanceId, InstanceEntry>>,
}

impl InstanceTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, InstanceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, instance: InstanceId) -> Option<ActionState> {
        self.lock().get(&instance).map(|entry| entry.state)
    }

    /// Moves `instance` to `next`, returning the previous state.
    pub(crate) fn transition(
        &self,
        instance: InstanceId,
        next: ActionState,
    ) -> Result<ActionState, SagaError> {
        let mut entries = self.lock();
        let entry = entries.entry(instance).or_default();
        let from = entry.state;
        if !from.can_transition_to(next) {
            return Err(SagaError::InvalidState {
                instance,
                from,
                to: next,
            });
        }
        entry.state = next;
        Ok(from)
    }

    /// Drops `instance` once its rollback has finished.
    ///
    /// Only Failed entries are removed. Succeeded entries stay because a
    /// later parent abort still has to roll them back. Returns true if the
    /// entry was removed.
    pub(crate) fn forget(&self, instance: InstanceId) -> bool {
        let mut entries = self.lock();
        match entries.get(&instance) {
            Some(entry) if entry.state == ActionState::Failed => {
                entries.remove(&instance);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Called once perform has stored and announced its result.
    pub(crate) fn after_commit(&self, instance: InstanceId, has_dependencies: bool) -> Settle {
        let mut entries = self.lock();
        let entry = entries.entry(instance).or_default();
        if let Some(verdict) = entry.pending_gate.take() {
            return Settle::Now(verdict);
        }
        if !has_dependencies {
            return Settle::Now(Verdict::ReadStatus);
        }
        if entry.state == ActionState::Executing {
            entry.state = ActionState::AwaitingDependencies;
        }
        Settle::Await
    }

    /// Called when the dependency gate fires or a parent abort finds the
    /// gate already complete.
    pub(crate) fn gate_fired(&self, instance: InstanceId, verdict: Verdict) -> GateDecision {
        let mut entries = self.lock();
        let entry = entries.entry(instance).or_default();
        match entry.state {
            ActionState::Idle | ActionState::Executing => {
                entry.pending_gate = Some(match entry.pending_gate {
                    Some(pending) => pending.merge(verdict),
                    None => verdict,
                });
                GateDecision::Deferred
            }
            ActionState::AwaitingDependencies | ActionState::Succeeded => GateDecision::Decide,
            ActionState::RollingBack | ActionState::Failed => GateDecision::Settled,
        }
    }
}
