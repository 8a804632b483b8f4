//! Process-level bootstrap: registry, storage, pool, listener and remain
//! watchdogs wired together.

use crate::config::{ListenerConfig, MeshConfig};
use crate::context::MeshContext;
use crate::edge::EdgeClients;
use crate::link::{Dialer, Dispatch, LinkEnv};
use crate::listener::{MeshListener, MeshListenerHandle};
use crate::pool::LinkPool;
use crate::registry::{DispatchFn, PeerRegistry, RegistryOptions, ServerStorage};
use crate::server::ServerDescriptor;
use crate::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Builder for [`Mesh`].
pub struct MeshBuilder {
    local: ServerDescriptor,
    config: MeshConfig,
    storage: Option<Arc<dyn ServerStorage>>,
    dispatch: Option<Arc<dyn Dispatch>>,
    edge: Option<Arc<dyn EdgeClients>>,
    dialer: Option<Arc<dyn Dialer>>,
    dispatchers: HashMap<String, DispatchFn>,
}

impl MeshBuilder {
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage<S: ServerStorage>(mut self, storage: S) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Handler module serving user actions on every link.
    pub fn handler<D: Dispatch>(mut self, dispatch: D) -> Self {
        self.dispatch = Some(Arc::new(dispatch));
        self
    }

    /// Locally connected edge clients, for the session actions.
    pub fn edge(mut self, edge: Arc<dyn EdgeClients>) -> Self {
        self.edge = Some(edge);
        self
    }

    /// Groups to keep connected, added to those from the config.
    pub fn remain<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for group in groups {
            let group = group.into();
            if !self.config.remain.contains(&group) {
                self.config.remain.push(group);
            }
        }
        self
    }

    pub fn dispatcher(mut self, group: impl Into<String>, dispatcher: DispatchFn) -> Self {
        self.dispatchers.insert(group.into(), dispatcher);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Validate, register with storage, start listening and connecting.
    pub async fn build(self) -> Result<Mesh> {
        let mut local = self.local;
        local.validate()?;

        let listener = match local.remote_port {
            Some(port) => {
                let listener = TcpListener::bind((local.host.as_str(), port)).await?;
                local.remote_port = Some(listener.local_addr()?.port());
                Some(listener)
            }
            None => None,
        };

        let registry = PeerRegistry::new();
        registry.configure(RegistryOptions {
            server_info: Some(local.clone()),
            storage: self.storage,
            dispatchers: self.dispatchers,
            auto_sync: self.config.auto_sync,
            sync_interval: self.config.sync_interval,
        })?;
        registry.start().await?;

        let mut env = LinkEnv::new(local.clone()).with_options(self.config.link.clone());
        if let Some(dispatch) = self.dispatch {
            env = env.with_dispatch(dispatch);
        }
        if let Some(edge) = self.edge {
            env = env.with_edge(edge);
        }
        if let Some(dialer) = self.dialer {
            env = env.with_dialer(dialer);
        }
        let pool = LinkPool::new(registry.clone(), env, self.config.pool.clone());

        let listener = match listener {
            Some(listener) => {
                let max = self
                    .config
                    .max_connections
                    .unwrap_or(ListenerConfig::MAX_CONNECTIONS);
                Some(MeshListener::serve(listener, pool.clone(), max)?)
            }
            None => None,
        };
        pool.start_remain(&self.config.remain);

        info!("Mesh node {} is up", local);
        Ok(Mesh {
            context: pool.context(),
            listener: Mutex::new(listener),
        })
    }
}

/// A running mesh node.
pub struct Mesh {
    context: MeshContext,
    listener: Mutex<Option<MeshListenerHandle>>,
}

impl Mesh {
    pub fn builder(local: ServerDescriptor) -> MeshBuilder {
        MeshBuilder {
            local,
            config: MeshConfig::default(),
            storage: None,
            dispatch: None,
            edge: None,
            dialer: None,
            dispatchers: HashMap::new(),
        }
    }

    pub fn context(&self) -> MeshContext {
        self.context.clone()
    }

    /// Local descriptor, with the bound remote port filled in.
    pub fn local(&self) -> &ServerDescriptor {
        self.context.local()
    }

    pub fn registry(&self) -> &PeerRegistry {
        self.context.registry()
    }

    pub fn pool(&self) -> &LinkPool {
        self.context.pool()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(MeshListenerHandle::addr)
    }

    /// Close every link, announce this server's departure and stop the
    /// listener and auto-sync.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down mesh node {}", self.local());
        self.pool().drop().await;
        let dropped = self.registry().drop().await;
        if let Err(e) = &dropped {
            warn!("Could not announce departure: {}", e);
        }
        self.registry().stop();

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
        dropped
    }
}
