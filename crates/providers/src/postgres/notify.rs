use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::communication::{CommunicationProvider, MessageHandler, spawn_dispatcher};
use crate::lifecycle::Lifecycle;
use crate::{ProviderError, Result};

const PROVIDER: &str = "postgres communication";

/// PostgreSQL rejects notification payloads of 8000 bytes or more.
const NOTIFY_PAYLOAD_LIMIT: usize = 7900;

/// Longest identifier PostgreSQL keeps without truncation.
const MAX_CHANNEL_LEN: usize = 63;

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

type Routes = Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>>;

/// What travels inside one `NOTIFY`.
#[derive(Debug, Serialize, Deserialize)]
struct NotifyEnvelope {
    topic: String,
    body: NotifyBody,
}

/// A message body as notification text.
///
/// UTF-8 bodies are embedded as they are; anything else is base64 encoded.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NotifyBody {
    Text(String),
    Base64(String),
}

impl NotifyBody {
    fn encode(payload: &Bytes) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) => NotifyBody::Text(text.to_string()),
            Err(_) => NotifyBody::Base64(STANDARD.encode(payload)),
        }
    }

    fn decode(self) -> std::result::Result<Bytes, base64::DecodeError> {
        match self {
            NotifyBody::Text(text) => Ok(Bytes::from(text)),
            NotifyBody::Base64(encoded) => STANDARD.decode(encoded).map(Bytes::from),
        }
    }
}

/// PostgreSQL `LISTEN`/`NOTIFY` communication provider.
///
/// Every handle initialized with the same namespace shares one notification
/// channel. A single listener task per handle receives the channel's
/// notifications and routes them by topic to the local subscriptions.
pub struct PostgresCommunicationProvider {
    pool: PgPool,
    lifecycle: RwLock<Lifecycle>,
    routes: Routes,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresCommunicationProvider {
    /// Creates a new provider over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lifecycle: RwLock::new(Lifecycle::default()),
            routes: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<String> {
        let lifecycle = self.lifecycle.read().await;
        Ok(channel_name(lifecycle.namespace(PROVIDER)?))
    }
}

impl std::fmt::Debug for PostgresCommunicationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCommunicationProvider")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CommunicationProvider for PostgresCommunicationProvider {
    async fn initialize(&self, namespace: &str) -> Result<()> {
        self.lifecycle.write().await.open(namespace)?;
        let channel = channel_name(namespace);

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&channel).await?;

        let task = tokio::spawn(route_notifications(listener, Arc::clone(&self.routes)));
        if let Some(previous) = self.listener.lock().await.replace(task) {
            previous.abort();
        }

        tracing::info!(%namespace, %channel, "postgres communication initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.lifecycle.write().await = Lifecycle::Closed;
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        self.routes.write().await.clear();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let channel = self.channel().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        spawn_dispatcher(topic.to_string(), rx, handler);
        tracing::debug!(%channel, %topic, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let channel = self.channel().await?;
        let envelope = serde_json::to_string(&NotifyEnvelope {
            topic: topic.to_string(),
            body: NotifyBody::encode(&payload),
        })?;

        if envelope.len() > NOTIFY_PAYLOAD_LIMIT {
            return Err(ProviderError::PayloadTooLarge {
                topic: topic.to_string(),
                size: envelope.len(),
                limit: NOTIFY_PAYLOAD_LIMIT,
            });
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(&envelope)
            .execute(&self.pool)
            .await?;

        metrics::counter!("saga_messages_published_total").increment(1);
        tracing::debug!(%channel, %topic, "published");
        Ok(())
    }
}

/// Receives notifications until the task is aborted.
///
/// `PgListener` reconnects on the next `recv` after a connection loss, so
/// errors are logged and retried after a short delay.
async fn route_notifications(mut listener: PgListener, routes: Routes) {
    loop {
        let notification = match listener.recv().await {
            Ok(notification) => notification,
            Err(e) => {
                tracing::error!(error = %e, "notification listener error");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                continue;
            }
        };

        let envelope: NotifyEnvelope = match serde_json::from_str(notification.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    channel = notification.channel(),
                    error = %e,
                    "dropping malformed notification"
                );
                continue;
            }
        };

        let topic = envelope.topic;
        let body = match envelope.body.decode() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(%topic, error = %e, "dropping notification with undecodable body");
                continue;
            }
        };

        let mut routes = routes.write().await;
        if let Some(senders) = routes.get_mut(&topic) {
            senders.retain(|tx| tx.send(body.clone()).is_ok());
        }
    }
}

/// Maps a namespace onto a lower-case PostgreSQL channel identifier.
fn channel_name(namespace: &str) -> String {
    let mut channel: String = format!("saga_{namespace}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    channel.truncate(MAX_CHANNEL_LEN);
    channel
}
