use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Result;

/// Receives messages delivered to one subscription.
///
/// Every delivered message gets its own `handle` invocation, and invocations
/// for different messages may run concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one message body.
    async fn handle(&self, payload: Bytes);
}

/// Core trait for topic-based publish/subscribe transports.
///
/// Topics exist implicitly by name and routing is exact-match: a message
/// published to `t` reaches every subscription on `t` within the same
/// namespace, and nothing else. Messages published to one topic by one
/// publisher reach each subscriber in publish order; there is no ordering
/// across topics.
#[async_trait]
pub trait CommunicationProvider: Send + Sync {
    /// Connects and scopes this handle's topics to `namespace`.
    async fn initialize(&self, namespace: &str) -> Result<()>;

    /// Drops every subscription and releases the connection.
    async fn close(&self) -> Result<()>;

    /// Subscribes `handler` to `topic`.
    ///
    /// The subscription is live when this returns: messages published
    /// afterwards are delivered.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Publishes `payload` to `topic`. Publishing to a topic nobody listens
    /// on succeeds and the message is dropped.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Returns the namespaced form of `topic`.
pub fn qualified_topic(namespace: &str, topic: &str) -> String {
    format!("{namespace}.{topic}")
}

/// Drains one subscription's queue, spawning a handler task per message.
pub(crate) fn spawn_dispatcher(
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    handler: Arc<dyn MessageHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            tracing::debug!(%topic, size = payload.len(), "dispatching message");
            metrics::counter!("saga_messages_delivered_total").increment(1);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(payload).await });
        }
        tracing::debug!(%topic, "subscription closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Forward(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, payload: Bytes) {
            let _ = self.0.send(payload);
        }
    }

    #[test]
    fn qualified_topic_prefixes_namespace() {
        assert_eq!(qualified_topic("orders", "a_Started"), "orders.a_Started");
    }

    #[tokio::test]
    async fn dispatcher_invokes_handler_per_message() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = spawn_dispatcher("t".to_string(), rx, Arc::new(Forward(out_tx)));

        tx.send(Bytes::from_static(b"one")).unwrap();
        tx.send(Bytes::from_static(b"two")).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(msg);
        }
        seen.sort();
        assert_eq!(seen, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
