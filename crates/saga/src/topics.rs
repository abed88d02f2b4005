//! Communication topic naming.

use crate::action::ActionDescriptor;
use crate::events::LifecycleEvent;

/// The four lifecycle topics one action announces on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicationTopics {
    started: String,
    succeeded: String,
    failed: String,
    aborted: String,
}

impl CommunicationTopics {
    /// Derives the topics of the action called `action`.
    pub fn for_action(action: &str) -> Self {
        Self {
            started: topic_name(action, LifecycleEvent::Started),
            succeeded: topic_name(action, LifecycleEvent::Succeeded),
            failed: topic_name(action, LifecycleEvent::Failed),
            aborted: topic_name(action, LifecycleEvent::Aborted),
        }
    }

    /// Returns the topic announcing `event`.
    pub fn topic(&self, event: LifecycleEvent) -> &str {
        match event {
            LifecycleEvent::Started => &self.started,
            LifecycleEvent::Succeeded => &self.succeeded,
            LifecycleEvent::Failed => &self.failed,
            LifecycleEvent::Aborted => &self.aborted,
        }
    }
}

/// One topic a coordinator listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The action announcing on this topic.
    pub source: String,
    /// The event the topic carries.
    pub event: LifecycleEvent,
    pub topic: String,
}

impl Subscription {
    fn new(source: &str, event: LifecycleEvent) -> Self {
        Self {
            source: source.to_string(),
            event,
            topic: topic_name(source, event),
        }
    }
}

/// Lists the topics the coordinator of `descriptor` must subscribe to.
///
/// Parent Started and Aborted come first, then Succeeded and Failed of each
/// dependency in declaration order.
pub fn subscriptions(descriptor: &ActionDescriptor) -> Vec<Subscription> {
    let mut subscriptions = Vec::with_capacity(2 + 2 * descriptor.dependencies().len());

    if let Some(parent) = descriptor.parent() {
        subscriptions.push(Subscription::new(parent, LifecycleEvent::Started));
        subscriptions.push(Subscription::new(parent, LifecycleEvent::Aborted));
    }

    for dependency in descriptor.dependencies() {
        subscriptions.push(Subscription::new(dependency, LifecycleEvent::Succeeded));
        subscriptions.push(Subscription::new(dependency, LifecycleEvent::Failed));
    }

    subscriptions
}

fn topic_name(action: &str, event: LifecycleEvent) -> String {
    format!("{action}_{}", event.as_str())
}
