//! Storage collaborator of the peer registry.
//!
//! The registry never decides on its own which servers exist; it mirrors a
//! directory that several processes share. Implementations decide where that
//! directory lives.

use super::PeerRegistry;
use crate::server::{ServerDescriptor, ServerMap};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Shared server directory.
///
/// Every method receives the registry that called it so implementations can
/// push a fresh view back with [`PeerRegistry::sync`].
#[async_trait::async_trait]
pub trait ServerStorage: Send + Sync + 'static {
    /// Announce `local` as online and seed the registry.
    async fn start(&self, registry: &PeerRegistry, local: &ServerDescriptor) -> Result<()>;

    /// Record `server` as online.
    async fn add(&self, registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()>;

    /// `server` is gone because our link to it was destroyed.
    async fn remove(&self, registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()>;

    /// `server` announced its own departure or could not be reached.
    async fn drop_server(&self, registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()>;

    /// Current online servers, keyed by group.
    async fn get(&self) -> Result<ServerMap>;
}

/// In-process directory. Clones share the same state, so several meshes in
/// one process (tests, embedded deployments) see each other.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    servers: Arc<Mutex<BTreeMap<String, BTreeMap<String, ServerDescriptor>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with `servers`.
    pub fn with_servers(servers: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        let storage = Self::new();
        for server in servers {
            storage.insert(server);
        }
        storage
    }

    /// Add a server without going through a registry.
    pub fn insert(&self, server: ServerDescriptor) {
        self.lock()
            .entry(server.group.clone())
            .or_default()
            .insert(server.id.clone(), server);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, ServerDescriptor>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delete(&self, server: &ServerDescriptor) {
        let mut servers = self.lock();
        if let Some(members) = servers.get_mut(&server.group) {
            members.remove(&server.id);
            if members.is_empty() {
                servers.remove(&server.group);
            }
        }
    }

    fn snapshot(&self) -> ServerMap {
        self.lock()
            .iter()
            .map(|(group, members)| (group.clone(), members.values().cloned().collect()))
            .collect()
    }
}

#[async_trait::async_trait]
impl ServerStorage for MemoryStorage {
    async fn start(&self, registry: &PeerRegistry, local: &ServerDescriptor) -> Result<()> {
        self.insert(local.clone());
        registry.sync(Some(self.snapshot())).await
    }

    async fn add(&self, _registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()> {
        self.insert(server.clone());
        Ok(())
    }

    async fn remove(&self, _registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()> {
        debug!("Removing {} from memory storage", server.key());
        self.delete(server);
        Ok(())
    }

    async fn drop_server(&self, _registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()> {
        debug!("Dropping {} from memory storage", server.key());
        self.delete(server);
        Ok(())
    }

    async fn get(&self) -> Result<ServerMap> {
        Ok(self.snapshot())
    }
}
