//! Peer registry and its storage backends.

mod peer_registry;
mod sqlite_storage;
mod storage;

pub use peer_registry::{DispatchFn, PeerRegistry, RegistryOptions};
pub use sqlite_storage::{ServerStatus, SqliteStorage};
pub use storage::{MemoryStorage, ServerStorage};
