//! In-memory providers for tests and single-process sagas.

mod broker;
mod storage;

pub use broker::{InMemoryBroker, InMemoryCommunicationProvider};
pub use storage::{InMemoryStorageProvider, InMemoryStore};
