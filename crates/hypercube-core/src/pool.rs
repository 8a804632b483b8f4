//! The set of live peer links of one process, keyed by `(group, id)`.
//!
//! All reactions to link lifecycle events run on a single event task, so the
//! pool map only ever changes under its lock or from that task. Remain
//! groups get a watchdog task each that keeps a link open to every member.

use crate::config::PoolOptions;
use crate::context::{MeshContext, WeakMeshContext};
use crate::link::{close_code, close_payload, LinkEnv, LinkEvent, PeerLink};
use crate::registry::PeerRegistry;
use crate::server::ServerDescriptor;
use crate::session::SessionToken;
use crate::{MeshError, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct PooledLink {
    link: PeerLink,
    /// Kept alive by a remain watchdog; reconnects after a disconnect.
    remain: bool,
}

#[derive(Default)]
struct PoolState {
    links: HashMap<String, HashMap<String, PooledLink>>,
    /// Inbound links whose peer has not announced itself yet.
    unannounced: HashMap<u64, PeerLink>,
    remain: HashSet<String>,
    watchdogs: HashMap<String, JoinHandle<()>>,
    shutting_down: bool,
}

struct PoolInner {
    local: ServerDescriptor,
    registry: PeerRegistry,
    env: LinkEnv,
    options: PoolOptions,
    state: Mutex<PoolState>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// Live links of this process. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct LinkPool {
    inner: Arc<PoolInner>,
}

/// Non-owning pool handle for links.
#[derive(Clone)]
pub(crate) struct WeakLinkPool(Weak<PoolInner>);

impl WeakLinkPool {
    pub(crate) fn upgrade(&self) -> Option<LinkPool> {
        self.0.upgrade().map(|inner| LinkPool { inner })
    }
}

impl LinkPool {
    /// Create a pool whose links use `env` as template. Must be called
    /// within a Tokio runtime.
    pub fn new(registry: PeerRegistry, env: LinkEnv, options: PoolOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let local = env.local.clone();
            let mut env = env.with_events(events_tx);
            env.context = Some(WeakMeshContext::new(
                local.clone(),
                registry.clone(),
                WeakLinkPool(weak.clone()),
            ));
            PoolInner {
                local,
                registry,
                env,
                options,
                state: Mutex::new(PoolState::default()),
                event_task: Mutex::new(None),
            }
        });

        let task = tokio::spawn(Self::event_loop(Arc::downgrade(&inner), events_rx));
        *inner.event_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local(&self) -> &ServerDescriptor {
        &self.inner.local
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn context(&self) -> MeshContext {
        MeshContext::new(self.inner.local.clone(), self.inner.registry.clone(), self.clone())
    }

    /// Pooled link for `(group, id)`, if any.
    pub fn get_link(&self, group: &str, id: &str) -> Option<PeerLink> {
        self.lock()
            .links
            .get(group)?
            .get(id)
            .map(|pooled| pooled.link.clone())
    }

    /// Every pooled link, announced peers only.
    pub fn links(&self) -> Vec<PeerLink> {
        self.lock()
            .links
            .values()
            .flat_map(|members| members.values().map(|pooled| pooled.link.clone()))
            .collect()
    }

    /// Cached link to `target`, or a new outbound link. A new link is
    /// returned at once and connects in the background.
    pub async fn load(&self, target: &ServerDescriptor) -> Result<PeerLink> {
        let link = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(MeshError::SocketClosed);
            }
            let remain = state.remain.contains(&target.group);
            let members = state.links.entry(target.group.clone()).or_default();
            match members.get(&target.id) {
                Some(pooled) if !pooled.link.is_closed() => return Ok(pooled.link.clone()),
                _ => {
                    let link = PeerLink::connect_to(target.clone(), self.inner.env.clone());
                    members.insert(
                        target.id.clone(),
                        PooledLink {
                            link: link.clone(),
                            remain,
                        },
                    );
                    link
                }
            }
        };

        debug!("Opened link to {}", target.key());
        if let Err(e) = self.inner.registry.add_server(target).await {
            warn!("Could not register {}: {}", target.key(), e);
        }
        Ok(link)
    }

    /// Request on the link to `target`.
    pub async fn request(
        &self,
        target: &ServerDescriptor,
        action: &str,
        payload: Value,
        session: Option<&SessionToken>,
    ) -> Result<Value> {
        self.load(target).await?.request(action, payload, session).await
    }

    /// Fire-and-forget message on the link to `target`.
    pub async fn push(
        &self,
        target: &ServerDescriptor,
        action: &str,
        payload: Value,
        session: Option<&SessionToken>,
    ) -> Result<()> {
        self.load(target).await?.push(action, payload, session).await
    }

    /// Wrap an accepted connection in an inbound link. The link joins the
    /// pool once its peer announces itself.
    pub fn add_inbound_link<S>(&self, stream: S) -> PeerLink
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        PeerLink::accept(stream, self.inner.env.clone())
    }

    /// Keep `groups` connected: one watchdog per group, started at most once.
    pub fn start_remain(&self, groups: &[String]) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        for group in groups {
            state.remain.insert(group.clone());
            if state.watchdogs.contains_key(group) {
                continue;
            }
            info!("Keeping group {} connected", group);
            let task = tokio::spawn(Self::remain_loop(Arc::downgrade(&self.inner), group.clone()));
            state.watchdogs.insert(group.clone(), task);
        }
    }

    /// Force-close every link and wait for all of them.
    ///
    /// Links closed here do not report their peers to storage: the peers
    /// are still alive, only this process is leaving.
    pub async fn drop(&self) {
        let links: Vec<PeerLink> = {
            let mut state = self.lock();
            state.shutting_down = true;
            for (_, task) in state.watchdogs.drain() {
                task.abort();
            }
            state
                .links
                .values()
                .flat_map(|members| members.values().map(|pooled| pooled.link.clone()))
                .chain(state.unannounced.values().cloned())
                .collect()
        };
        info!("Closing {} peer links", links.len());
        futures::future::join_all(links.iter().map(|link| link.close(true, None))).await;
    }

    // ========================================
    // Lifecycle events
    // ========================================

    async fn event_loop(weak: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            LinkPool { inner }.on_event(event).await;
        }
    }

    async fn on_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Open(link) => self.on_open(link),
            LinkEvent::Init(link) => self.on_init(link).await,
            LinkEvent::Disconnect(link) => self.on_disconnect(link),
            LinkEvent::Drop(link) => self.on_drop(link).await,
            LinkEvent::Destroy(link) => self.on_destroy(link).await,
        }
    }

    fn on_open(&self, link: PeerLink) {
        let rejected = {
            let mut state = self.lock();
            if !state.shutting_down {
                state.unannounced.insert(link.link_id(), link.clone());
            }
            state.shutting_down
        };
        if rejected {
            tokio::spawn(async move { link.close(false, None).await });
        }
    }

    async fn on_init(&self, link: PeerLink) {
        let Some(peer) = link.peer() else {
            return;
        };
        if peer.key() == self.inner.local.key() {
            debug!("Loopback link {} stays out of the pool", link.link_id());
            return;
        }

        let duplicate = {
            let mut state = self.lock();
            let Some(link) = state.unannounced.remove(&link.link_id()) else {
                // Closed before it announced itself.
                return;
            };
            let members = state.links.entry(peer.group.clone()).or_default();
            match members.get(&peer.id) {
                Some(existing) if !existing.link.is_closed() => true,
                _ => {
                    members.insert(peer.id.clone(), PooledLink { link, remain: false });
                    false
                }
            }
        };

        if duplicate {
            warn!("Repeat connect from {}, closing the new link", peer.key());
            tokio::spawn(async move {
                let payload = close_payload(close_code::REPEAT_CONNECT, "repeat connect");
                link.close(true, Some(payload)).await;
            });
            return;
        }

        info!("Peer {} joined", peer.key());
        if let Err(e) = self.inner.registry.add_server(&peer).await {
            warn!("Could not register {}: {}", peer.key(), e);
        }
    }

    fn on_disconnect(&self, link: PeerLink) {
        let Some(peer) = link.peer() else {
            return;
        };
        let remain = {
            let state = self.lock();
            !state.shutting_down
                && state
                    .links
                    .get(&peer.group)
                    .and_then(|members| members.get(&peer.id))
                    .map(|pooled| pooled.remain && pooled.link.ptr_eq(&link))
                    .unwrap_or(false)
        };
        if remain {
            tokio::spawn(async move {
                if let Err(e) = link.reconnect().await {
                    warn!("Reconnect to {} failed: {}", peer.key(), e);
                }
            });
        }
    }

    async fn on_drop(&self, link: PeerLink) {
        let Some(peer) = link.peer() else {
            return;
        };
        if self.lock().shutting_down {
            return;
        }
        info!("Peer {} dropped", peer.key());
        if let Err(e) = self.inner.registry.drop_server(&peer).await {
            warn!("Could not drop {}: {}", peer.key(), e);
        }
    }

    async fn on_destroy(&self, link: PeerLink) {
        let (pooled, shutting_down) = {
            let mut state = self.lock();
            state.unannounced.remove(&link.link_id());
            let pooled = link.peer().filter(|peer| {
                let Some(members) = state.links.get_mut(&peer.group) else {
                    return false;
                };
                let owned = members
                    .get(&peer.id)
                    .map(|pooled| pooled.link.ptr_eq(&link))
                    .unwrap_or(false);
                if owned {
                    members.remove(&peer.id);
                    if members.is_empty() {
                        state.links.remove(&peer.group);
                    }
                }
                owned
            });
            (pooled, state.shutting_down)
        };

        let Some(peer) = pooled else {
            return;
        };
        debug!("Link to {} destroyed", peer.key());
        if shutting_down {
            return;
        }
        if let Err(e) = self.inner.registry.remove_server(&peer).await {
            warn!("Could not remove {}: {}", peer.key(), e);
        }
    }

    // ========================================
    // Remain watchdog
    // ========================================

    async fn remain_loop(weak: Weak<PoolInner>, group: String) {
        let mut delay = match weak.upgrade() {
            Some(inner) => inner.options.retry_delay(0),
            None => return,
        };
        let mut step = 0;
        loop {
            debug!("Next remain check of {} in {:?}", group, delay);
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let pool = LinkPool { inner };
            let linked = match pool.remain_check(&group).await {
                Ok(linked) => linked,
                Err(e) => {
                    warn!("Remain check of {} failed: {}", group, e);
                    false
                }
            };
            let options = &pool.inner.options;
            delay = if linked {
                step = 0;
                options.update_interval
            } else {
                step += 1;
                options.retry_delay(step)
            };
        }
    }

    /// Open links to members of `group` not yet pooled. An empty group
    /// triggers a resync and reports `false`; the next check sees the result.
    async fn remain_check(&self, group: &str) -> Result<bool> {
        let registry = &self.inner.registry;
        let members = registry.get_servers(group);
        if members.is_empty() {
            debug!("Remain group {} has no members, resyncing", group);
            registry.sync(None).await?;
            return Ok(false);
        }

        let local = self.inner.local.key();
        let mut state = self.lock();
        if state.shutting_down {
            return Ok(true);
        }
        for member in members {
            if member.key() == local {
                continue;
            }
            let linked = state
                .links
                .get(group)
                .map(|pooled| pooled.contains_key(&member.id))
                .unwrap_or(false);
            if linked {
                continue;
            }
            info!("Connecting to remain member {}", member.key());
            let link = PeerLink::connect_to(member.clone(), self.inner.env.clone());
            state
                .links
                .entry(group.to_string())
                .or_default()
                .insert(member.id.clone(), PooledLink { link, remain: true });
        }
        Ok(true)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in state.watchdogs.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{native, BoxedReader, BoxedWriter, Dialer, HandlerModule, LinkPhase};
    use crate::registry::{MemoryStorage, RegistryOptions};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Never finishes dialing; outbound links stay in `CONNECTING`.
    struct StallDialer;

    #[async_trait::async_trait]
    impl Dialer for StallDialer {
        async fn dial(&self, _target: &ServerDescriptor, _timeout: Duration) -> Result<(BoxedReader, BoxedWriter)> {
            futures::future::pending().await
        }
    }

    fn server(group: &str, id: &str) -> ServerDescriptor {
        ServerDescriptor::new(id, group, "127.0.0.1").with_remote_port(4001)
    }

    fn echo() -> Arc<HandlerModule> {
        Arc::new(
            HandlerModule::new()
                .route("echo", |req| async move { Ok(req.payload().clone()) })
                .unwrap(),
        )
    }

    fn pool_for(local: ServerDescriptor, storage: MemoryStorage) -> LinkPool {
        let registry = PeerRegistry::new();
        registry
            .configure(RegistryOptions {
                server_info: Some(local.clone()),
                storage: Some(Arc::new(storage)),
                ..Default::default()
            })
            .unwrap();
        let env = LinkEnv::new(local)
            .with_dispatch(echo())
            .with_dialer(Arc::new(StallDialer));
        LinkPool::new(registry, env, PoolOptions::default())
    }

    /// The far end of an inbound link, announcing itself as `me`.
    async fn announce(stream: DuplexStream, me: &ServerDescriptor) -> PeerLink {
        let link = PeerLink::accept(stream, LinkEnv::new(me.clone()).with_dispatch(echo()));
        link.push(native::SERVER_INFO, serde_json::to_value(me).unwrap(), None)
            .await
            .unwrap();
        link
    }

    async fn eventually(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_load_caches_links() {
        let pool = pool_for(server("gate", "1"), MemoryStorage::new());
        let target = server("lobby", "7");

        let first = pool.load(&target).await.unwrap();
        let second = pool.load(&target).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert!(pool.registry().has_server("lobby", "7"));
        assert!(pool.get_link("lobby", "7").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_announcement_is_rejected() {
        let pool = pool_for(server("lobby", "1"), MemoryStorage::new());
        let peer = server("gate", "3");

        let (a, a_peer) = tokio::io::duplex(64 * 1024);
        let first = pool.add_inbound_link(a);
        let _remote_a = announce(a_peer, &peer).await;
        eventually(|| pool.get_link("gate", "3").is_some()).await;

        let (b, b_peer) = tokio::io::duplex(64 * 1024);
        let second = pool.add_inbound_link(b);
        let _remote_b = announce(b_peer, &peer).await;
        eventually(|| second.is_closed()).await;

        assert!(pool.get_link("gate", "3").unwrap().ptr_eq(&first));
        assert!(!first.is_closed());
        assert!(pool.registry().has_server("gate", "3"));
    }

    #[tokio::test]
    async fn test_destroyed_link_leaves_pool_and_registry() {
        let pool = pool_for(server("lobby", "1"), MemoryStorage::new());
        let peer = server("gate", "3");

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let inbound = pool.add_inbound_link(ours);
        let remote = announce(theirs, &peer).await;
        eventually(|| pool.registry().has_server("gate", "3")).await;

        remote.close(false, None).await;
        eventually(|| pool.get_link("gate", "3").is_none()).await;
        eventually(|| !pool.registry().has_server("gate", "3")).await;
        assert!(inbound.is_closed());
    }

    #[tokio::test]
    async fn test_pooled_inbound_link_serves_requests_back() {
        let pool = pool_for(server("lobby", "1"), MemoryStorage::new());
        let peer = server("gate", "3");

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        pool.add_inbound_link(ours);
        let _remote = announce(theirs, &peer).await;
        eventually(|| pool.get_link("gate", "3").is_some()).await;

        let reply = pool.request(&peer, "echo", json!({"n": 1}), None).await.unwrap();
        assert_eq!(reply, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_drop_closes_all_links() {
        let pool = pool_for(server("gate", "1"), MemoryStorage::new());
        let link = pool.load(&server("lobby", "7")).await.unwrap();

        pool.drop().await;

        assert_eq!(link.phase(), LinkPhase::Closed);
        assert!(matches!(
            pool.load(&server("lobby", "8")).await,
            Err(MeshError::SocketClosed)
        ));
        // Peers are not reported as gone when this process leaves.
        assert!(pool.registry().has_server("lobby", "7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remain_watchdog_backs_off_then_connects() {
        let storage = MemoryStorage::new();
        let pool = pool_for(server("gate", "1"), storage.clone());

        pool.start_remain(&["lobby".to_string()]);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        storage.insert(server("lobby", "7"));

        // First check at 5s finds the group empty and only resyncs.
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(!pool.registry().has_server("lobby", "7"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.registry().has_server("lobby", "7"));
        assert!(pool.get_link("lobby", "7").is_none());

        // Second check follows after the next backoff step.
        tokio::time::sleep(Duration::from_millis(9_800)).await;
        assert!(pool.get_link("lobby", "7").is_none());
        tokio::time::sleep(Duration::from_millis(200)).await;
        let link = pool.get_link("lobby", "7").expect("remain member linked");
        assert_eq!(link.phase(), LinkPhase::Connecting);

        // Steady state: the next check runs after the update interval.
        let storage_peer = server("lobby", "8");
        storage.insert(storage_peer);
        pool.registry().sync(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(29_000)).await;
        assert!(pool.get_link("lobby", "8").is_none());
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(pool.get_link("lobby", "8").is_some());
    }
}
