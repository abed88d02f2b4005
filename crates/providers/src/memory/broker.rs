use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::communication::{
    CommunicationProvider, MessageHandler, qualified_topic, spawn_dispatcher,
};
use crate::lifecycle::Lifecycle;
use crate::Result;

const PROVIDER: &str = "in-memory communication";

type SubscriptionId = u64;

#[derive(Debug, Default)]
struct BrokerState {
    routes: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Bytes>)>>,
    log: HashMap<String, Vec<Bytes>>,
    next_subscription: SubscriptionId,
}

/// Shared in-memory message hub.
///
/// Every [`InMemoryCommunicationProvider`] created from one broker can reach
/// the others. The broker also keeps a log of every published message so
/// tests can assert on what was announced.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new broker with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message published to `topic` in `namespace`, oldest first.
    pub async fn published(&self, namespace: &str, topic: &str) -> Vec<Bytes> {
        self.state
            .read()
            .await
            .log
            .get(&qualified_topic(namespace, topic))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of messages published to `topic` in `namespace`.
    pub async fn publish_count(&self, namespace: &str, topic: &str) -> usize {
        self.state
            .read()
            .await
            .log
            .get(&qualified_topic(namespace, topic))
            .map_or(0, Vec::len)
    }

    /// Returns the number of live subscriptions on `topic` in `namespace`.
    pub async fn subscriber_count(&self, namespace: &str, topic: &str) -> usize {
        self.state
            .read()
            .await
            .routes
            .get(&qualified_topic(namespace, topic))
            .map_or(0, Vec::len)
    }

    async fn add_route(&self, topic: String, tx: mpsc::UnboundedSender<Bytes>) -> SubscriptionId {
        let mut state = self.state.write().await;
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.routes.entry(topic).or_default().push((id, tx));
        id
    }

    async fn remove_routes(&self, ids: &[(String, SubscriptionId)]) {
        let mut state = self.state.write().await;
        for (topic, id) in ids {
            if let Some(routes) = state.routes.get_mut(topic) {
                routes.retain(|(route_id, _)| route_id != id);
                if routes.is_empty() {
                    state.routes.remove(topic);
                }
            }
        }
    }

    async fn deliver(&self, topic: String, payload: Bytes) -> usize {
        let mut state = self.state.write().await;
        state.log.entry(topic.clone()).or_default().push(payload.clone());

        let mut delivered = 0;
        if let Some(routes) = state.routes.get_mut(&topic) {
            // A closed receiver means its dispatcher is gone.
            routes.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
            delivered = routes.len();
        }
        delivered
    }
}

#[derive(Debug, Default)]
struct Subscriptions {
    routes: Vec<(String, SubscriptionId)>,
    dispatchers: Vec<JoinHandle<()>>,
}

/// In-memory communication provider for testing.
///
/// One handle per participant; all handles built from the same
/// [`InMemoryBroker`] share topics within a namespace.
#[derive(Debug)]
pub struct InMemoryCommunicationProvider {
    broker: InMemoryBroker,
    lifecycle: RwLock<Lifecycle>,
    subscriptions: RwLock<Subscriptions>,
}

impl InMemoryCommunicationProvider {
    /// Creates a provider handle connected to `broker`.
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            lifecycle: RwLock::new(Lifecycle::default()),
            subscriptions: RwLock::new(Subscriptions::default()),
        }
    }

    /// Returns the broker this handle is connected to.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    async fn qualify(&self, topic: &str) -> Result<String> {
        let lifecycle = self.lifecycle.read().await;
        let namespace = lifecycle.namespace(PROVIDER)?;
        Ok(qualified_topic(namespace, topic))
    }
}

#[async_trait]
impl CommunicationProvider for InMemoryCommunicationProvider {
    async fn initialize(&self, namespace: &str) -> Result<()> {
        self.lifecycle.write().await.open(namespace)?;
        tracing::debug!(%namespace, "in-memory communication initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.lifecycle.write().await = Lifecycle::Closed;
        let subscriptions = std::mem::take(&mut *self.subscriptions.write().await);
        // Removing the routes drops the senders; each dispatcher then ends
        // once its queue drains.
        self.broker.remove_routes(&subscriptions.routes).await;
        drop(subscriptions.dispatchers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let qualified = self.qualify(topic).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.broker.add_route(qualified.clone(), tx).await;
        let dispatcher = spawn_dispatcher(qualified.clone(), rx, handler);

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.routes.push((qualified.clone(), id));
        subscriptions.dispatchers.push(dispatcher);
        tracing::debug!(topic = %qualified, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let qualified = self.qualify(topic).await?;
        let delivered = self.broker.deliver(qualified.clone(), payload).await;
        metrics::counter!("saga_messages_published_total").increment(1);
        tracing::debug!(topic = %qualified, delivered, "published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderError;
    use std::time::Duration;

    struct Forward(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, payload: Bytes) {
            let _ = self.0.send(payload);
        }
    }

    async fn connected(broker: &InMemoryBroker, namespace: &str) -> InMemoryCommunicationProvider {
        let provider = InMemoryCommunicationProvider::new(broker.clone());
        provider.initialize(namespace).await.unwrap();
        provider
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_on_same_topic() {
        let broker = InMemoryBroker::new();
        let publisher = connected(&broker, "saga").await;
        let subscriber = connected(&broker, "saga").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("a_Started", Arc::new(Forward(tx)))
            .await
            .unwrap();

        publisher
            .publish("a_Started", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn routing_is_exact_match() {
        let broker = InMemoryBroker::new();
        let provider = connected(&broker, "saga").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider
            .subscribe("a_Started", Arc::new(Forward(tx)))
            .await
            .unwrap();

        provider
            .publish("a_Aborted", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let broker = InMemoryBroker::new();
        let publisher = connected(&broker, "one").await;
        let subscriber = connected(&broker, "two").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("a_Started", Arc::new(Forward(tx)))
            .await
            .unwrap();

        publisher
            .publish("a_Started", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, None);
        assert_eq!(broker.publish_count("one", "a_Started").await, 1);
        assert_eq!(broker.publish_count("two", "a_Started").await, 0);
    }

    #[tokio::test]
    async fn every_subscription_gets_a_copy() {
        let broker = InMemoryBroker::new();
        let provider = connected(&broker, "saga").await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        provider.subscribe("t", Arc::new(Forward(tx1))).await.unwrap();
        provider.subscribe("t", Arc::new(Forward(tx2))).await.unwrap();
        assert_eq!(broker.subscriber_count("saga", "t").await, 2);

        provider.publish("t", Bytes::from_static(b"m")).await.unwrap();

        assert_eq!(recv(&mut rx1).await, Some(Bytes::from_static(b"m")));
        assert_eq!(recv(&mut rx2).await, Some(Bytes::from_static(b"m")));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_logged() {
        let broker = InMemoryBroker::new();
        let provider = connected(&broker, "saga").await;

        provider.publish("t", Bytes::from_static(b"1")).await.unwrap();
        provider.publish("t", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(
            broker.published("saga", "t").await,
            vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]
        );
    }

    #[tokio::test]
    async fn close_removes_subscriptions() {
        let broker = InMemoryBroker::new();
        let provider = connected(&broker, "saga").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        provider.subscribe("t", Arc::new(Forward(tx))).await.unwrap();

        provider.close().await.unwrap();

        assert_eq!(broker.subscriber_count("saga", "t").await, 0);
        let err = provider
            .publish("t", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AlreadyClosed));
    }

    #[tokio::test]
    async fn subscribe_requires_initialize() {
        let provider = InMemoryCommunicationProvider::new(InMemoryBroker::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = provider
            .subscribe("t", Arc::new(Forward(tx)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotInitialized { .. }));
    }
}
