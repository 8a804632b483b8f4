//! In-memory directory of mesh servers per group.

use super::storage::ServerStorage;
use crate::config::RegistryConfig;
use crate::server::{ServerDescriptor, ServerMap};
use crate::session::SessionToken;
use crate::{MeshError, Result};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Picks one server out of a group's members for a caller.
pub type DispatchFn =
    Arc<dyn Fn(&[ServerDescriptor], Option<&SessionToken>) -> Option<ServerDescriptor> + Send + Sync>;

/// Options accepted by [`PeerRegistry::configure`].
#[derive(Clone, Default)]
pub struct RegistryOptions {
    pub server_info: Option<ServerDescriptor>,
    pub storage: Option<Arc<dyn ServerStorage>>,
    /// Per-group dispatch strategies; other groups pick uniformly at random.
    pub dispatchers: HashMap<String, DispatchFn>,
    pub auto_sync: bool,
    pub sync_interval: Option<Duration>,
}

struct RegistryState {
    local: Option<ServerDescriptor>,
    storage: Option<Arc<dyn ServerStorage>>,
    dispatchers: HashMap<String, DispatchFn>,
    auto_sync: bool,
    sync_interval: Duration,
    groups: HashMap<String, BTreeMap<String, ServerDescriptor>>,
    sync_task: Option<JoinHandle<()>>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
}

/// Which servers exist, per group. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    local: None,
                    storage: None,
                    dispatchers: HashMap::new(),
                    auto_sync: false,
                    sync_interval: RegistryConfig::SYNC_INTERVAL,
                    groups: HashMap::new(),
                    sync_task: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the local identity, the storage collaborator and dispatchers.
    pub fn configure(&self, options: RegistryOptions) -> Result<()> {
        let local = options
            .server_info
            .ok_or_else(|| MeshError::invalid_params("registry needs the local server info"))?;
        let storage = options
            .storage
            .ok_or_else(|| MeshError::invalid_params("registry needs a storage module"))?;

        let mut state = self.lock();
        state.local = Some(local);
        state.storage = Some(storage);
        state.dispatchers.extend(options.dispatchers);
        state.auto_sync = options.auto_sync;
        if options.auto_sync {
            if let Some(interval) = options.sync_interval.filter(|d| !d.is_zero()) {
                state.sync_interval = interval;
            }
        }
        Ok(())
    }

    /// Register a dispatch strategy for one group.
    pub fn set_dispatcher(&self, group: impl Into<String>, dispatcher: DispatchFn) {
        self.lock().dispatchers.insert(group.into(), dispatcher);
    }

    /// Identity of this process, once configured.
    pub fn local(&self) -> Option<ServerDescriptor> {
        self.lock().local.clone()
    }

    fn storage(&self) -> Result<Arc<dyn ServerStorage>> {
        self.lock()
            .storage
            .clone()
            .ok_or_else(|| MeshError::InvalidStorageModule {
                message: "no storage module bound to the registry".to_string(),
            })
    }

    /// Announce the local server to storage and, with auto-sync on, keep
    /// pulling the directory every sync interval.
    pub async fn start(&self) -> Result<()> {
        let storage = self.storage()?;
        let local = self
            .local()
            .ok_or_else(|| MeshError::invalid_params("registry is not configured"))?;
        storage.start(self, &local).await?;

        let mut state = self.lock();
        if state.auto_sync && state.sync_task.is_none() {
            let interval = state.sync_interval;
            let weak = Arc::downgrade(&self.inner);
            state.sync_task = Some(tokio::spawn(Self::auto_sync_loop(weak, interval)));
            info!("Registry auto-sync every {:?}", interval);
        }
        Ok(())
    }

    async fn auto_sync_loop(weak: Weak<RegistryInner>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let registry = PeerRegistry { inner };
            if let Err(e) = registry.sync(None).await {
                warn!("Registry auto-sync failed: {}", e);
            }
        }
    }

    /// Stop the auto-sync task, if any.
    pub fn stop(&self) {
        if let Some(handle) = self.lock().sync_task.take() {
            handle.abort();
        }
    }

    /// Look a server up by id, or dispatch within the group when no id is given.
    pub fn get_server(
        &self,
        group: &str,
        session: Option<&SessionToken>,
        id: Option<&str>,
    ) -> Option<ServerDescriptor> {
        match id {
            Some(id) => self.lock().groups.get(group)?.get(id).cloned(),
            None => self.dispatch(group, session),
        }
    }

    /// Pick a member of `group` with its dispatcher, or uniformly at random.
    pub fn dispatch(&self, group: &str, session: Option<&SessionToken>) -> Option<ServerDescriptor> {
        let (members, dispatcher) = {
            let state = self.lock();
            let members: Vec<ServerDescriptor> = state.groups.get(group)?.values().cloned().collect();
            (members, state.dispatchers.get(group).cloned())
        };
        if members.is_empty() {
            return None;
        }
        match dispatcher {
            Some(dispatch) => dispatch(&members, session),
            None => {
                let idx = rand::rng().random_range(0..members.len());
                members.into_iter().nth(idx)
            }
        }
    }

    /// Members of one group, or of every group for `"*"`.
    pub fn get_servers(&self, group: &str) -> Vec<ServerDescriptor> {
        let state = self.lock();
        if group == "*" {
            let mut groups: Vec<_> = state.groups.iter().collect();
            groups.sort_by(|a, b| a.0.cmp(b.0));
            return groups
                .into_iter()
                .flat_map(|(_, members)| members.values().cloned())
                .collect();
        }
        state
            .groups
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the whole directory.
    pub fn get_all_servers(&self) -> ServerMap {
        self.lock()
            .groups
            .iter()
            .map(|(group, members)| (group.clone(), members.values().cloned().collect()))
            .collect()
    }

    pub fn has_server(&self, group: &str, id: &str) -> bool {
        self.lock()
            .groups
            .get(group)
            .map(|members| members.contains_key(id))
            .unwrap_or(false)
    }

    pub async fn add_server(&self, server: &ServerDescriptor) -> Result<()> {
        let storage = self.storage()?;
        self.lock()
            .groups
            .entry(server.group.clone())
            .or_default()
            .insert(server.id.clone(), server.clone());
        storage.add(self, server).await
    }

    pub async fn remove_server(&self, server: &ServerDescriptor) -> Result<()> {
        let storage = self.storage()?;
        self.forget(server);
        storage.remove(self, server).await
    }

    pub async fn drop_server(&self, server: &ServerDescriptor) -> Result<()> {
        let storage = self.storage()?;
        self.forget(server);
        storage.drop_server(self, server).await
    }

    /// Announce the departure of this process.
    pub async fn drop(&self) -> Result<()> {
        let storage = self.storage()?;
        let local = self
            .local()
            .ok_or_else(|| MeshError::invalid_params("registry is not configured"))?;
        storage.drop_server(self, &local).await
    }

    fn forget(&self, server: &ServerDescriptor) {
        let mut state = self.lock();
        if let Some(members) = state.groups.get_mut(&server.group) {
            members.remove(&server.id);
            if members.is_empty() {
                state.groups.remove(&server.group);
            }
        }
    }

    /// Replace each named group wholesale. Pulls from storage when no list
    /// is given. Groups absent from the list are left untouched.
    pub async fn sync(&self, servers: Option<ServerMap>) -> Result<()> {
        let servers = match servers {
            Some(servers) => servers,
            None => self.storage()?.get().await?,
        };

        let mut state = self.lock();
        for (group, list) in servers {
            let members: BTreeMap<String, ServerDescriptor> = list
                .into_iter()
                .map(|server| (server.id.clone(), server))
                .collect();
            if members.is_empty() {
                state.groups.remove(&group);
            } else {
                debug!("Synced group {} with {} servers", group, members.len());
                state.groups.insert(group, members);
            }
        }
        Ok(())
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = state.sync_task.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStorage;

    fn server(group: &str, id: &str) -> ServerDescriptor {
        ServerDescriptor::new(id, group, "127.0.0.1").with_remote_port(9000)
    }

    fn configured(storage: MemoryStorage) -> PeerRegistry {
        let registry = PeerRegistry::new();
        registry
            .configure(RegistryOptions {
                server_info: Some(server("gate", "1")),
                storage: Some(Arc::new(storage)),
                ..Default::default()
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_configure_requires_server_info_and_storage() {
        let registry = PeerRegistry::new();
        let err = registry.configure(RegistryOptions::default()).unwrap_err();
        assert!(matches!(err, MeshError::InvalidParams { .. }));

        let err = registry
            .configure(RegistryOptions {
                server_info: Some(server("gate", "1")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_unconfigured_storage_is_reported() {
        let registry = PeerRegistry::new();
        let err = registry.add_server(&server("chat", "1")).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidStorageModule { .. }));
        assert!(matches!(
            registry.sync(None).await,
            Err(MeshError::InvalidStorageModule { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_replaces_named_groups() {
        let registry = configured(MemoryStorage::new());
        let mut list = ServerMap::new();
        list.insert("chat".into(), vec![server("chat", "1"), server("chat", "2")]);
        list.insert("game".into(), vec![server("game", "7")]);
        registry.sync(Some(list.clone())).await.unwrap();
        registry.sync(Some(list)).await.unwrap();

        assert_eq!(registry.get_servers("chat").len(), 2);
        assert_eq!(registry.get_servers("*").len(), 3);

        let mut replacement = ServerMap::new();
        replacement.insert("chat".into(), vec![server("chat", "3")]);
        registry.sync(Some(replacement)).await.unwrap();

        let chat = registry.get_servers("chat");
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].id, "3");
        assert!(registry.has_server("game", "7"));
    }

    #[tokio::test]
    async fn test_sync_with_empty_list_removes_group() {
        let registry = configured(MemoryStorage::new());
        let mut list = ServerMap::new();
        list.insert("chat".into(), vec![server("chat", "1")]);
        registry.sync(Some(list)).await.unwrap();

        let mut empty = ServerMap::new();
        empty.insert("chat".into(), Vec::new());
        registry.sync(Some(empty)).await.unwrap();

        assert!(registry.get_all_servers().is_empty());
        assert!(registry.dispatch("chat", None).is_none());
    }

    #[tokio::test]
    async fn test_uniform_dispatch() {
        let registry = configured(MemoryStorage::new());
        let mut list = ServerMap::new();
        list.insert("chat".into(), vec![server("chat", "1"), server("chat", "2")]);
        registry.sync(Some(list)).await.unwrap();

        let picks = 10_000;
        let first = (0..picks)
            .filter(|_| registry.dispatch("chat", None).unwrap().id == "1")
            .count();
        let share = first as f64 / picks as f64;
        assert!((0.45..0.55).contains(&share), "share of server 1 was {}", share);
    }

    #[tokio::test]
    async fn test_custom_dispatcher_and_direct_lookup() {
        let registry = configured(MemoryStorage::new());
        registry.set_dispatcher(
            "chat",
            Arc::new(|members: &[ServerDescriptor], _: Option<&SessionToken>| members.last().cloned()),
        );
        let mut list = ServerMap::new();
        list.insert("chat".into(), vec![server("chat", "1"), server("chat", "2")]);
        registry.sync(Some(list)).await.unwrap();

        for _ in 0..20 {
            assert_eq!(registry.get_server("chat", None, None).unwrap().id, "2");
        }
        assert_eq!(registry.get_server("chat", None, Some("1")).unwrap().id, "1");
        assert!(registry.get_server("chat", None, Some("9")).is_none());
        assert!(registry.get_server("nope", None, None).is_none());
    }

    #[tokio::test]
    async fn test_add_and_remove_forward_to_storage() {
        let storage = MemoryStorage::new();
        let registry = configured(storage.clone());
        let chat = server("chat", "1");

        registry.add_server(&chat).await.unwrap();
        assert!(registry.has_server("chat", "1"));
        assert_eq!(storage.get().await.unwrap()["chat"].len(), 1);

        registry.remove_server(&chat).await.unwrap();
        assert!(!registry.get_all_servers().contains_key("chat"));
        assert!(storage.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_announces_local_server() {
        let storage = MemoryStorage::with_servers([server("chat", "4")]);
        let registry = configured(storage.clone());
        registry.start().await.unwrap();

        assert!(registry.has_server("gate", "1"));
        assert!(registry.has_server("chat", "4"));

        registry.drop().await.unwrap();
        assert!(!storage.get().await.unwrap().contains_key("gate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_pulls_storage() {
        let storage = MemoryStorage::new();
        let registry = PeerRegistry::new();
        registry
            .configure(RegistryOptions {
                server_info: Some(server("gate", "1")),
                storage: Some(Arc::new(storage.clone())),
                auto_sync: true,
                sync_interval: Some(Duration::from_millis(1000)),
                ..Default::default()
            })
            .unwrap();
        registry.start().await.unwrap();

        storage.insert(server("chat", "2"));
        assert!(!registry.has_server("chat", "2"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(registry.has_server("chat", "2"));

        registry.stop();
        storage.insert(server("chat", "3"));
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(!registry.has_server("chat", "3"));
    }
}
