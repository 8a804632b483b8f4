//! Boundary to the client-facing edge server.
//!
//! The mesh never talks to edge clients itself. When a process also runs an
//! edge server, it hands the mesh an [`EdgeClients`] view so that session and
//! push actions arriving from peers can be fulfilled locally.

use crate::link::MessageId;
use crate::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

/// One client connected to the local edge server.
#[async_trait::async_trait]
pub trait EdgeClient: Send + Sync {
    fn id(&self) -> String;

    /// Copy of the client's session.
    fn session(&self) -> Map<String, Value>;

    /// Merge into the client's session, or replace it when `cover` is set.
    fn set_session(&self, values: Map<String, Value>, cover: bool);

    async fn send(&self, action: &str, payload: Value, id: MessageId) -> Result<()>;

    async fn close(&self, reason: Value);
}

/// Lookup of locally connected edge clients.
pub trait EdgeClients: Send + Sync + 'static {
    fn get_client(&self, cid: &str) -> Option<Arc<dyn EdgeClient>>;

    /// Every connected client (the `"*"` form).
    fn clients(&self) -> Vec<Arc<dyn EdgeClient>>;
}
