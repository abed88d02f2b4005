//! Collaborator interfaces consumed by the saga coordinator.
//!
//! Two capabilities are defined here:
//! - [`StorageProvider`]: an atomic counter / key-value store
//! - [`CommunicationProvider`]: topic-based publish/subscribe
//!
//! Each comes with an in-memory implementation for tests and single-process
//! sagas, and a PostgreSQL implementation for sagas spanning processes.

pub mod communication;
pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod storage;

mod lifecycle;

pub use communication::{CommunicationProvider, MessageHandler, qualified_topic};
pub use config::PostgresConfig;
pub use error::{ProviderError, Result};
pub use memory::{
    InMemoryBroker, InMemoryCommunicationProvider, InMemoryStorageProvider, InMemoryStore,
};
pub use postgres::{PostgresCommunicationProvider, PostgresStorageProvider};
pub use storage::{StorageProvider, StorageProviderExt};
