//! Explicit handle to the mesh a component belongs to.

use crate::pool::{LinkPool, WeakLinkPool};
use crate::registry::PeerRegistry;
use crate::server::ServerDescriptor;

/// Local identity, server directory and link pool of one process.
#[derive(Clone)]
pub struct MeshContext {
    local: ServerDescriptor,
    registry: PeerRegistry,
    pool: LinkPool,
}

impl MeshContext {
    pub fn new(local: ServerDescriptor, registry: PeerRegistry, pool: LinkPool) -> Self {
        Self {
            local,
            registry,
            pool,
        }
    }

    pub fn local(&self) -> &ServerDescriptor {
        &self.local
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &LinkPool {
        &self.pool
    }
}

/// Context held by links; does not keep the pool alive.
#[derive(Clone)]
pub(crate) struct WeakMeshContext {
    local: ServerDescriptor,
    registry: PeerRegistry,
    pool: WeakLinkPool,
}

impl WeakMeshContext {
    pub(crate) fn new(local: ServerDescriptor, registry: PeerRegistry, pool: WeakLinkPool) -> Self {
        Self {
            local,
            registry,
            pool,
        }
    }

    pub(crate) fn upgrade(&self) -> Option<MeshContext> {
        Some(MeshContext::new(
            self.local.clone(),
            self.registry.clone(),
            self.pool.upgrade()?,
        ))
    }
}
