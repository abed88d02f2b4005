//! PostgreSQL-backed providers.
//!
//! Storage uses a single `saga_kv` table (see `migrations/`); messaging uses
//! `LISTEN`/`NOTIFY` with one notification channel per namespace.

mod notify;
mod storage;

pub use notify::PostgresCommunicationProvider;
pub use storage::PostgresStorageProvider;
