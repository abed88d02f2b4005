//! An in-memory [`Action`] that records its calls.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::Payload;

use crate::action::{Action, ActionError};

#[derive(Debug, Default)]
struct RecordingState {
    inputs: Vec<Payload>,
    performed: Vec<Payload>,
    compensated: Vec<Payload>,
    next_id: u32,
    fail_on_perform: bool,
    fail_on_compensate: bool,
    perform_delay: Option<Duration>,
}

/// Action for tests and local experiments.
///
/// Every successful perform returns a fresh result of the form
/// `<label>-0001`, which makes compensation calls easy to check.
#[derive(Debug, Clone)]
pub struct RecordingAction {
    label: Arc<str>,
    state: Arc<RwLock<RecordingState>>,
}

impl RecordingAction {
    /// Creates a recording action whose results start with `label`.
    pub fn new(label: impl AsRef<str>) -> Self {
        Self {
            label: Arc::from(label.as_ref()),
            state: Arc::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RecordingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RecordingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures perform to fail.
    pub fn set_fail_on_perform(&self, fail: bool) {
        self.write().fail_on_perform = fail;
    }

    /// Configures compensate to fail.
    pub fn set_fail_on_compensate(&self, fail: bool) {
        self.write().fail_on_compensate = fail;
    }

    /// Makes perform sleep before returning.
    pub fn set_perform_delay(&self, delay: Duration) {
        self.write().perform_delay = Some(delay);
    }

    /// Payloads perform was called with, in call order.
    pub fn inputs(&self) -> Vec<Payload> {
        self.read().inputs.clone()
    }

    /// Results returned by successful performs.
    pub fn performed(&self) -> Vec<Payload> {
        self.read().performed.clone()
    }

    /// Results compensate was called with, including failed attempts.
    pub fn compensated(&self) -> Vec<Payload> {
        self.read().compensated.clone()
    }

    pub fn perform_count(&self) -> usize {
        self.read().inputs.len()
    }

    pub fn compensate_count(&self) -> usize {
        self.read().compensated.len()
    }
}

#[async_trait]
impl Action for RecordingAction {
    async fn perform(&self, payload: Payload) -> Result<Payload, ActionError> {
        let delay = {
            let mut state = self.write();
            state.inputs.push(payload);
            state.perform_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        if state.fail_on_perform {
            return Err(ActionError::new(format!("{} perform failed", self.label)));
        }

        state.next_id += 1;
        let result = Bytes::from(format!("{}-{:04}", self.label, state.next_id));
        state.performed.push(result.clone());
        Ok(result)
    }

    async fn compensate(&self, result: Payload) -> Result<(), ActionError> {
        let mut state = self.write();
        state.compensated.push(result);
        if state.fail_on_compensate {
            return Err(ActionError::new(format!(
                "{} compensate failed",
                self.label
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_perform_and_compensate() {
        let action = RecordingAction::new("RES");

        let result = action.perform(Bytes::from_static(b"order")).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"RES-0001"));
        assert_eq!(action.inputs(), vec![Bytes::from_static(b"order")]);

        action.compensate(result.clone()).await.unwrap();
        assert_eq!(action.compensated(), vec![result]);
    }

    #[tokio::test]
    async fn test_results_are_numbered() {
        let action = RecordingAction::new("PAY");
        action.perform(Bytes::new()).await.unwrap();
        let second = action.perform(Bytes::new()).await.unwrap();
        assert_eq!(second, Bytes::from_static(b"PAY-0002"));
        assert_eq!(action.perform_count(), 2);
    }

    #[tokio::test]
    async fn test_fail_on_perform() {
        let action = RecordingAction::new("SHP");
        action.set_fail_on_perform(true);

        let err = action.perform(Bytes::new()).await.unwrap_err();
        assert_eq!(err.message(), "SHP perform failed");
        assert!(action.performed().is_empty());
        assert_eq!(action.perform_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_on_compensate_still_records() {
        let action = RecordingAction::new("SHP");
        action.set_fail_on_compensate(true);

        assert!(action.compensate(Bytes::from_static(b"x")).await.is_err());
        assert_eq!(action.compensate_count(), 1);
    }
}
