//! Transaction coordinator for one action of a choreographed saga.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{InstanceId, Payload};
use providers::{CommunicationProvider, MessageHandler, StorageProvider, StorageProviderExt};

use crate::action::ActionDescriptor;
use crate::completion::{CompletionRegistry, Outcome};
use crate::error::SagaError;
use crate::events::{LifecycleEvent, LifecycleMessage};
use crate::keys::{STATUS_FAILED, StorageKeys, validate_name};
use crate::state::{ActionState, GateDecision, InstanceTable, Settle, Verdict};
use crate::topics::{self, CommunicationTopics, Subscription};

/// Runs one action of a saga and reacts to its parent and dependencies.
///
/// Every participant of a saga builds its own coordinator with the same saga
/// name. The name scopes both providers: topics live in the saga's
/// namespace, and storage keys in `<saga>:<action>`.
pub struct TransactionCoordinator<C, S>
where
    C: CommunicationProvider + 'static,
    S: StorageProvider + 'static,
{
    saga_name: String,
    comm: Arc<C>,
    storage: Arc<S>,
    core: Option<Arc<CoordinatorCore<C, S>>>,
    started: AtomicBool,
}

impl<C, S> TransactionCoordinator<C, S>
where
    C: CommunicationProvider + 'static,
    S: StorageProvider + 'static,
{
    /// Creates a coordinator for the saga called `saga_name`.
    pub fn new(saga_name: impl Into<String>, comm: C, storage: S) -> Self {
        Self {
            saga_name: saga_name.into(),
            comm: Arc::new(comm),
            storage: Arc::new(storage),
            core: None,
            started: AtomicBool::new(false),
        }
    }

    /// Binds `descriptor`, initializes both providers and subscribes to the
    /// parent's and dependencies' lifecycle topics.
    ///
    /// Every subscription is live when this returns.
    #[tracing::instrument(skip(self, descriptor), fields(saga = %self.saga_name, action = %descriptor.name()))]
    pub async fn initialize(&mut self, descriptor: ActionDescriptor) -> Result<(), SagaError> {
        if self.core.is_some() {
            return Err(SagaError::AlreadyInitialized);
        }
        validate_name("saga", &self.saga_name)?;

        let keys = StorageKeys::new(&self.saga_name, descriptor.name());
        self.storage.initialize(keys.namespace()).await?;
        self.comm.initialize(&self.saga_name).await?;

        let subscriptions = topics::subscriptions(&descriptor);
        let core = Arc::new(CoordinatorCore {
            topics: CommunicationTopics::for_action(descriptor.name()),
            keys,
            descriptor,
            comm: Arc::clone(&self.comm),
            storage: Arc::clone(&self.storage),
            table: InstanceTable::default(),
            completion: CompletionRegistry::new(),
        });

        for subscription in subscriptions {
            let topic = subscription.topic.clone();
            let handler = Arc::new(LifecycleHandler {
                core: Arc::clone(&core),
                subscription,
            });
            self.comm.subscribe(&topic, handler).await?;
        }

        tracing::info!(
            parent = core.descriptor.parent().unwrap_or("-"),
            dependencies = core.descriptor.dependencies().len(),
            "coordinator initialized"
        );
        self.core = Some(core);
        Ok(())
    }

    /// Performs the action and waits until its branch of the saga resolves.
    ///
    /// Returns `Ok(())` once the action and all its dependencies succeeded.
    /// Any other outcome, including an immediate perform failure and a later
    /// rollback, is reported as [`SagaError::ActionFailed`]. There is no
    /// built-in deadline: wrap the call in `tokio::time::timeout` to bound
    /// the wait on dependencies that never report.
    pub async fn start(&self, payload: Payload) -> Result<(), SagaError> {
        let core = self.core.as_ref().ok_or(SagaError::NotInitialized)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SagaError::AlreadyStarted);
        }

        let action = core.descriptor.name().to_string();
        let started_at = std::time::Instant::now();
        let result = core.run(payload).await;
        metrics::histogram!("saga_action_duration_seconds", "action" => action.clone())
            .record(started_at.elapsed().as_secs_f64());

        result.map_err(|e| {
            tracing::error!(%action, error = %e, "action failed");
            SagaError::ActionFailed {
                action,
                reason: e.to_string(),
            }
        })
    }

    /// Closes both providers.
    ///
    /// Must not be called while `start` is still waiting.
    pub async fn close(&self) -> Result<(), SagaError> {
        self.comm.close().await?;
        self.storage.close().await?;
        tracing::info!(saga = %self.saga_name, "coordinator closed");
        Ok(())
    }

    /// Returns the local state of `instance`, if this coordinator tracks it.
    ///
    /// Rolled back instances are dropped once they reach Failed and read as
    /// `None`. Succeeded instances and failed performs stay tracked.
    pub fn state(&self, instance: InstanceId) -> Option<ActionState> {
        self.core.as_ref()?.table.get(instance)
    }

    /// Number of instances this coordinator currently tracks.
    pub fn tracked_instances(&self) -> usize {
        self.core.as_ref().map_or(0, |core| core.table.len())
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn descriptor(&self) -> Option<&ActionDescriptor> {
        self.core.as_ref().map(|core| &core.descriptor)
    }

    pub fn keys(&self) -> Option<&StorageKeys> {
        self.core.as_ref().map(|core| &core.keys)
    }

    pub fn topics(&self) -> Option<&CommunicationTopics> {
        self.core.as_ref().map(|core| &core.topics)
    }
}

/// State shared between `start` and the subscription handlers.
struct CoordinatorCore<C, S> {
    descriptor: ActionDescriptor,
    keys: StorageKeys,
    topics: CommunicationTopics,
    comm: Arc<C>,
    storage: Arc<S>,
    table: InstanceTable,
    completion: CompletionRegistry,
}

impl<C, S> CoordinatorCore<C, S>
where
    C: CommunicationProvider + 'static,
    S: StorageProvider + 'static,
{
    fn name(&self) -> &str {
        self.descriptor.name()
    }

    fn expected_arrivals(&self) -> i64 {
        self.descriptor.dependencies().len() as i64
    }

    /// Starts a fresh instance and waits for its outcome.
    async fn run(&self, payload: Payload) -> Result<(), SagaError> {
        let instance = InstanceId::new(self.storage.increment(self.keys.sequence()).await?);
        let waiter = self.completion.register(instance);

        if let Err(e) = self.perform(instance, payload).await {
            self.completion.discard(instance);
            return Err(e);
        }

        match waiter.await {
            Ok(Outcome::Succeeded) => Ok(()),
            Ok(Outcome::RolledBack) => Err(SagaError::RolledBack(instance)),
            Err(_) => Err(SagaError::CompletionLost(instance)),
        }
    }

    /// Performs the action for `instance`, stores the result and announces
    /// Started.
    ///
    /// Nothing is announced if any step fails.
    #[tracing::instrument(skip(self, input), fields(action = %self.name(), %instance))]
    async fn perform(&self, instance: InstanceId, input: Payload) -> Result<(), SagaError> {
        self.table.transition(instance, ActionState::Executing)?;
        metrics::counter!("saga_actions_performed_total", "action" => self.name().to_string())
            .increment(1);

        let result = match self.descriptor.action().perform(input).await {
            Ok(result) => result,
            Err(e) => {
                self.fail_perform(instance);
                return Err(e.into());
            }
        };

        if let Err(e) = self.commit(instance, result).await {
            self.fail_perform(instance);
            return Err(e);
        }

        match self
            .table
            .after_commit(instance, !self.descriptor.dependencies().is_empty())
        {
            Settle::Await => tracing::info!("performed, awaiting dependencies"),
            Settle::Now(verdict) => self.decide(instance, verdict).await,
        }
        Ok(())
    }

    async fn commit(&self, instance: InstanceId, result: Payload) -> Result<(), SagaError> {
        self.storage
            .set(&self.keys.result(instance), result.clone())
            .await?;
        self.announce(LifecycleMessage::started(self.name(), instance, result))
            .await
    }

    fn fail_perform(&self, instance: InstanceId) {
        metrics::counter!("saga_perform_failures_total", "action" => self.name().to_string())
            .increment(1);
        if let Err(e) = self.table.transition(instance, ActionState::Failed) {
            tracing::debug!(error = %e, "perform failure after settlement");
        }
    }

    async fn announce(&self, message: LifecycleMessage) -> Result<(), SagaError> {
        let topic = self.topics.topic(message.event);
        self.comm.publish(topic, message.encode()?).await?;
        tracing::debug!(%topic, instance = %message.instance_id, "announced");
        Ok(())
    }

    async fn announce_signal(&self, instance: InstanceId, event: LifecycleEvent) {
        let message = LifecycleMessage::signal(self.name(), event, instance);
        if let Err(e) = self.announce(message).await {
            tracing::error!(%instance, %event, error = %e, "failed to announce");
        }
    }

    /// Cascade from the parent: perform under the parent's instance id with
    /// the parent's result as input.
    async fn on_parent_started(&self, message: LifecycleMessage) {
        let instance = message.instance_id;
        if self.rolled_back(instance).await {
            tracing::debug!(%instance, "ignoring Started for rolled back instance");
            return;
        }
        match self.perform(instance, message.payload).await {
            Ok(()) => {}
            Err(SagaError::InvalidState { from, .. }) => {
                tracing::debug!(%instance, %from, "ignoring repeated Started");
            }
            Err(e) => {
                tracing::warn!(%instance, error = %e, "cascaded perform failed");
                self.announce_signal(instance, LifecycleEvent::Failed).await;
            }
        }
    }

    async fn on_parent_aborted(&self, instance: InstanceId) {
        tracing::warn!(%instance, "parent aborted");
        let mut verdict = Verdict::ReadStatus;
        if let Err(e) = self.mark_failed(instance).await {
            tracing::error!(%instance, error = %e, "failed to mark status");
            verdict = Verdict::RollBack;
        }

        match self.storage.get_counter(&self.keys.arrivals(instance)).await {
            Ok(count) if count >= self.expected_arrivals() => {
                self.resolve_gate(instance, verdict).await
            }
            Ok(count) => {
                tracing::debug!(%instance, count, "abort deferred to dependency gate");
            }
            Err(e) => {
                tracing::error!(%instance, error = %e, "failed to read arrivals");
                self.resolve_gate(instance, Verdict::RollBack).await;
            }
        }
    }

    async fn on_dependency_succeeded(&self, instance: InstanceId, dependency: &str) {
        match self.storage.increment(&self.keys.arrivals(instance)).await {
            Ok(count) => self.count_arrival(instance, dependency, count, Verdict::ReadStatus).await,
            Err(e) => {
                tracing::error!(%instance, error = %e, "failed to count arrival");
                self.resolve_gate(instance, Verdict::RollBack).await;
            }
        }
    }

    async fn on_dependency_failed(&self, instance: InstanceId, dependency: &str) {
        tracing::warn!(%instance, %dependency, "dependency failed");
        let status_written = match self.mark_failed(instance).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%instance, error = %e, "failed to mark status");
                false
            }
        };

        match self.storage.increment(&self.keys.arrivals(instance)).await {
            Ok(count) if status_written => {
                self.count_arrival(instance, dependency, count, Verdict::RollBack).await
            }
            Ok(_) => self.resolve_gate(instance, Verdict::RollBack).await,
            Err(e) => {
                tracing::error!(%instance, error = %e, "failed to count arrival");
                self.resolve_gate(instance, Verdict::RollBack).await;
            }
        }
    }

    async fn count_arrival(&self, instance: InstanceId, dependency: &str, count: i64, verdict: Verdict) {
        let expected = self.expected_arrivals();
        if count == expected {
            self.resolve_gate(instance, verdict).await;
        } else if count > expected {
            tracing::warn!(%instance, %dependency, count, expected, "arrival after gate fired");
        } else {
            tracing::debug!(%instance, %dependency, count, expected, "arrival counted");
        }
    }

    async fn mark_failed(&self, instance: InstanceId) -> Result<(), SagaError> {
        self.storage
            .set(&self.keys.status(instance), Payload::from_static(STATUS_FAILED.as_bytes()))
            .await?;
        Ok(())
    }

    async fn resolve_gate(&self, instance: InstanceId, verdict: Verdict) {
        if self.rolled_back(instance).await {
            tracing::debug!(%instance, "gate fired after rollback");
            return;
        }
        match self.table.gate_fired(instance, verdict) {
            GateDecision::Decide => self.decide(instance, verdict).await,
            GateDecision::Deferred => {
                tracing::debug!(%instance, ?verdict, "gate fired before perform finished");
            }
            GateDecision::Settled => {
                tracing::debug!(%instance, "gate fired after rollback");
            }
        }
    }

    /// True if `instance` was rolled back and dropped from the table.
    ///
    /// The result key is written only after the entry exists, so a stored
    /// result without an entry means the entry was forgotten.
    async fn rolled_back(&self, instance: InstanceId) -> bool {
        if self.table.get(instance).is_some() {
            return false;
        }
        match self.storage.get(&self.keys.result(instance)).await {
            Ok(result) => result.is_some(),
            Err(e) => {
                tracing::warn!(%instance, error = %e, "failed to read result");
                false
            }
        }
    }

    async fn decide(&self, instance: InstanceId, verdict: Verdict) {
        let roll_back = match verdict {
            Verdict::RollBack => true,
            Verdict::ReadStatus => {
                match self
                    .storage
                    .value_equals(&self.keys.status(instance), STATUS_FAILED.as_bytes())
                    .await
                {
                    Ok(failed) => failed,
                    Err(e) => {
                        tracing::error!(%instance, error = %e, "failed to read status");
                        true
                    }
                }
            }
        };

        if roll_back {
            self.rollback(instance).await;
        } else {
            self.complete(instance).await;
        }
    }

    #[tracing::instrument(skip(self), fields(action = %self.name()))]
    async fn complete(&self, instance: InstanceId) {
        if let Err(e) = self.table.transition(instance, ActionState::Succeeded) {
            tracing::debug!(error = %e, "completion skipped");
            return;
        }

        self.announce_signal(instance, LifecycleEvent::Succeeded).await;
        metrics::counter!("saga_actions_succeeded_total", "action" => self.name().to_string())
            .increment(1);
        tracing::info!("action succeeded");
        self.signal(instance, Outcome::Succeeded);
    }

    /// Compensates `instance` and tells dependents and children to roll back.
    ///
    /// Runs at most once per instance; Failed and Aborted are announced even
    /// if compensation fails.
    #[tracing::instrument(skip(self), fields(action = %self.name()))]
    async fn rollback(&self, instance: InstanceId) {
        let from = match self.table.transition(instance, ActionState::RollingBack) {
            Ok(from) => from,
            Err(e) => {
                tracing::debug!(error = %e, "rollback skipped");
                return;
            }
        };
        tracing::warn!(%from, "rolling back");

        match self.storage.get(&self.keys.result(instance)).await {
            Ok(Some(result)) => {
                if let Err(e) = self.descriptor.action().compensate(result).await {
                    self.compensation_failed(&e.to_string());
                }
            }
            Ok(None) => tracing::warn!("no stored result, nothing to compensate"),
            Err(e) => self.compensation_failed(&e.to_string()),
        }

        self.announce_signal(instance, LifecycleEvent::Failed).await;
        self.announce_signal(instance, LifecycleEvent::Aborted).await;

        if let Err(e) = self.table.transition(instance, ActionState::Failed) {
            tracing::error!(error = %e, "unexpected state after rollback");
        }
        metrics::counter!("saga_actions_rolled_back_total", "action" => self.name().to_string())
            .increment(1);
        self.signal(instance, Outcome::RolledBack);
        self.table.forget(instance);
    }

    fn compensation_failed(&self, reason: &str) {
        metrics::counter!("saga_compensation_failures_total", "action" => self.name().to_string())
            .increment(1);
        tracing::error!(%reason, "compensation failed");
    }

    fn signal(&self, instance: InstanceId, outcome: Outcome) {
        match self.completion.resolve(instance, outcome) {
            Ok(true) => tracing::debug!(%instance, ?outcome, "completion signalled"),
            Ok(false) => tracing::debug!(%instance, ?outcome, "no local waiter"),
            Err(e) => tracing::error!(error = %e, ?outcome, "duplicate completion"),
        }
    }
}

/// Routes one subscription's messages into the coordinator.
struct LifecycleHandler<C, S> {
    core: Arc<CoordinatorCore<C, S>>,
    subscription: Subscription,
}

#[async_trait]
impl<C, S> MessageHandler for LifecycleHandler<C, S>
where
    C: CommunicationProvider + 'static,
    S: StorageProvider + 'static,
{
    async fn handle(&self, payload: bytes::Bytes) {
        let message = match LifecycleMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(topic = %self.subscription.topic, error = %e, "dropping undecodable message");
                return;
            }
        };

        if message.event != self.subscription.event || message.action != self.subscription.source {
            tracing::warn!(
                topic = %self.subscription.topic,
                action = %message.action,
                event = %message.event,
                "dropping message that does not match its topic"
            );
            return;
        }

        let source = self.subscription.source.as_str();
        let instance = message.instance_id;
        match self.subscription.event {
            LifecycleEvent::Started => self.core.on_parent_started(message).await,
            LifecycleEvent::Aborted => self.core.on_parent_aborted(instance).await,
            LifecycleEvent::Succeeded => self.core.on_dependency_succeeded(instance, source).await,
            LifecycleEvent::Failed => self.core.on_dependency_failed(instance, source).await,
        }
    }
}
