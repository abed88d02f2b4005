//! Action descriptors and the user callbacks they carry.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::Payload;
use thiserror::Error;

use crate::error::SagaError;
use crate::keys::validate_name;

/// Failure reported by a user perform or compensate callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActionError {
    message: String,
}

impl ActionError {
    /// Creates an action error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The effect an action has and the inverse that undoes it.
#[async_trait]
pub trait Action: Send + Sync {
    /// Executes the action's effect and returns the result to keep for a
    /// later compensation.
    async fn perform(&self, payload: Payload) -> Result<Payload, ActionError>;

    /// Undoes the effect recorded by a previous `perform`.
    ///
    /// Receives exactly the bytes `perform` returned for that instance.
    async fn compensate(&self, result: Payload) -> Result<(), ActionError>;
}

/// An [`Action`] built from two plain functions.
pub struct FnAction<P, C> {
    perform: P,
    compensate: C,
}

impl<P, C> FnAction<P, C>
where
    P: Fn(Payload) -> Result<Payload, ActionError> + Send + Sync,
    C: Fn(Payload) -> Result<(), ActionError> + Send + Sync,
{
    /// Wraps a perform and a compensate function.
    pub fn new(perform: P, compensate: C) -> Self {
        Self {
            perform,
            compensate,
        }
    }
}

#[async_trait]
impl<P, C> Action for FnAction<P, C>
where
    P: Fn(Payload) -> Result<Payload, ActionError> + Send + Sync,
    C: Fn(Payload) -> Result<(), ActionError> + Send + Sync,
{
    async fn perform(&self, payload: Payload) -> Result<Payload, ActionError> {
        (self.perform)(payload)
    }

    async fn compensate(&self, result: Payload) -> Result<(), ActionError> {
        (self.compensate)(result)
    }
}

/// Static definition of one action in a saga.
///
/// `parent` and `dependencies` are independent: the parent decides when this
/// action starts and whether it must abort, the dependencies decide when it
/// is complete.
#[derive(Clone)]
pub struct ActionDescriptor {
    name: String,
    parent: Option<String>,
    dependencies: Vec<String>,
    action: Arc<dyn Action>,
}

impl ActionDescriptor {
    /// Starts building a descriptor for the action called `name`.
    pub fn builder(name: impl Into<String>) -> ActionDescriptorBuilder {
        ActionDescriptorBuilder {
            name: name.into(),
            parent: None,
            dependencies: Vec::new(),
            action: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The action whose Started/Aborted events drive this one, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Sibling actions that must each report before this one completes.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ActionDescriptor`].
pub struct ActionDescriptorBuilder {
    name: String,
    parent: Option<String>,
    dependencies: Vec<String>,
    action: Option<Arc<dyn Action>>,
}

impl ActionDescriptorBuilder {
    /// Sets the parent action. An empty name means no parent.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        self.parent = (!parent.is_empty()).then_some(parent);
        self
    }

    /// Adds one dependency.
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Adds several dependencies, keeping their order.
    pub fn dependencies<I, D>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Sets the callbacks.
    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    /// Sets callbacks that are shared with other owners.
    pub fn shared_action(mut self, action: Arc<dyn Action>) -> Self {
        self.action = Some(action);
        self
    }

    /// Validates and builds the descriptor.
    pub fn build(self) -> Result<ActionDescriptor, SagaError> {
        validate_name("action", &self.name)?;
        if let Some(parent) = &self.parent {
            validate_name("parent", parent)?;
        }

        if self.parent.as_deref() == Some(self.name.as_str()) {
            return Err(SagaError::InvalidDescriptor(format!(
                "action '{}' cannot be its own parent",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for dependency in &self.dependencies {
            validate_name("dependency", dependency)?;
            if *dependency == self.name {
                return Err(SagaError::InvalidDescriptor(format!(
                    "action '{}' cannot depend on itself",
                    self.name
                )));
            }
            // A duplicate would expect one more arrival than can ever happen.
            if !seen.insert(dependency.as_str()) {
                return Err(SagaError::InvalidDescriptor(format!(
                    "action '{}' lists dependency '{}' twice",
                    self.name, dependency
                )));
            }
        }

        let action = self.action.ok_or_else(|| {
            SagaError::InvalidDescriptor(format!("action '{}' has no callbacks", self.name))
        })?;

        Ok(ActionDescriptor {
            name: self.name,
            parent: self.parent,
            dependencies: self.dependencies,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn noop() -> FnAction<
        impl Fn(Payload) -> Result<Payload, ActionError> + Send + Sync,
        impl Fn(Payload) -> Result<(), ActionError> + Send + Sync,
    > {
        FnAction::new(|payload| Ok(payload), |_| Ok(()))
    }

    #[test]
    fn builds_root_with_dependencies() {
        let descriptor = ActionDescriptor::builder("root")
            .dependencies(["b", "c"])
            .action(noop())
            .build()
            .unwrap();

        assert_eq!(descriptor.name(), "root");
        assert!(descriptor.is_root());
        assert_eq!(descriptor.dependencies(), &["b", "c"]);
    }

    #[test]
    fn empty_parent_means_root() {
        let descriptor = ActionDescriptor::builder("a")
            .parent("")
            .action(noop())
            .build()
            .unwrap();
        assert_eq!(descriptor.parent(), None);
    }

    #[test]
    fn parent_and_dependencies_coexist() {
        let descriptor = ActionDescriptor::builder("ship")
            .parent("order")
            .depends_on("pay")
            .action(noop())
            .build()
            .unwrap();
        assert_eq!(descriptor.parent(), Some("order"));
        assert_eq!(descriptor.dependencies(), &["pay"]);
    }

    #[test]
    fn rejects_empty_name() {
        let err = ActionDescriptor::builder("").action(noop()).build().unwrap_err();
        assert!(matches!(err, SagaError::InvalidDescriptor(_)));
    }

    #[test]
    fn rejects_key_separator_in_names() {
        for builder in [
            ActionDescriptor::builder("a:b"),
            ActionDescriptor::builder("a").parent("p:q"),
            ActionDescriptor::builder("a").depends_on("x:1"),
        ] {
            let err = builder.action(noop()).build().unwrap_err();
            assert!(matches!(err, SagaError::InvalidDescriptor(_)));
        }
    }

    #[test]
    fn rejects_self_parent() {
        let err = ActionDescriptor::builder("a")
            .parent("a")
            .action(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDescriptor(_)));
    }

    #[test]
    fn rejects_self_dependency() {
        let err = ActionDescriptor::builder("a")
            .depends_on("a")
            .action(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDescriptor(_)));
    }

    #[test]
    fn rejects_duplicate_dependency() {
        let err = ActionDescriptor::builder("a")
            .dependencies(["b", "b"])
            .action(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDescriptor(_)));
    }

    #[test]
    fn rejects_missing_callbacks() {
        let err = ActionDescriptor::builder("a").build().unwrap_err();
        assert!(matches!(err, SagaError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn fn_action_calls_through() {
        let action = FnAction::new(
            |payload: Payload| Ok(Bytes::from(format!("done:{}", payload.len()))),
            |_| Err(ActionError::new("cannot undo")),
        );

        let result = action.perform(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(result, Bytes::from_static(b"done:3"));
        let err = action.compensate(result).await.unwrap_err();
        assert_eq!(err.message(), "cannot undo");
    }
}
