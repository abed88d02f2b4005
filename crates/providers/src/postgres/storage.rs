use async_trait::async_trait;
use bytes::Bytes;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::lifecycle::Lifecycle;
use crate::storage::StorageProvider;
use crate::{ProviderError, Result};

const PROVIDER: &str = "postgres storage";

/// SQLSTATE raised when a counter value is not valid integer text.
const INVALID_TEXT_REPRESENTATION: &str = "22P02";

/// PostgreSQL-backed storage provider.
///
/// The pool is shared with its owner; `close` ends this handle's lifecycle
/// but leaves the pool open for other users.
#[derive(Debug)]
pub struct PostgresStorageProvider {
    pool: PgPool,
    lifecycle: RwLock<Lifecycle>,
}

impl PostgresStorageProvider {
    /// Creates a new PostgreSQL storage provider.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lifecycle: RwLock::new(Lifecycle::default()),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.lifecycle.read().await.namespace(PROVIDER).map(|_| ())
    }
}

#[async_trait]
impl StorageProvider for PostgresStorageProvider {
    async fn initialize(&self, namespace: &str) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        self.lifecycle.write().await.open(namespace)?;
        tracing::info!(%namespace, "postgres storage initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.lifecycle.write().await = Lifecycle::Closed;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.ensure_ready().await?;

        // The row lock taken by ON CONFLICT DO UPDATE serializes concurrent
        // increments of one key.
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO saga_kv (key, value, updated_at)
            VALUES ($1, convert_to('1', 'UTF8'), now())
            ON CONFLICT (key) DO UPDATE
            SET value = convert_to((convert_from(saga_kv.value, 'UTF8')::BIGINT + 1)::TEXT, 'UTF8'),
                updated_at = now()
            RETURNING convert_from(value, 'UTF8')::BIGINT
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.code().as_deref() == Some(INVALID_TEXT_REPRESENTATION)
            {
                return ProviderError::InvalidCounter {
                    key: key.to_string(),
                    value: db_err.message().to_string(),
                };
            }
            ProviderError::Database(e)
        })
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_ready().await?;

        sqlx::query(
            r#"
            INSERT INTO saga_kv (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value.as_ref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_ready().await?;

        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM saga_kv WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.map(Bytes::from))
    }
}
