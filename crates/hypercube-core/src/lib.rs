//! Hypercube Core - inter-server RPC mesh for clustered game servers.
//!
//! Every process in a cluster is a server with an identity (`group`, `id`).
//! This crate lets those servers find each other through a shared directory,
//! keep persistent links between them and call each other with correlated
//! requests. A [`SessionToken`] carried on a call lets any server reach back
//! to the edge server a client is connected to.
//!
//! # Example
//!
//! ```rust,ignore
//! use hypercube_core::{HandlerModule, MemoryStorage, Mesh, ServerDescriptor};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> hypercube_core::Result<()> {
//!     let local = ServerDescriptor::new("1", "lobby", "127.0.0.1").with_remote_port(4100);
//!     let handlers = HandlerModule::new()
//!         .route("echo", |req| async move { Ok(req.payload().clone()) })?;
//!
//!     let mesh = Mesh::builder(local)
//!         .storage(MemoryStorage::new())
//!         .handler(handlers)
//!         .remain(["gate"])
//!         .build()
//!         .await?;
//!
//!     if let Some(gate) = mesh.registry().dispatch("gate", None) {
//!         let reply = mesh.pool().request(&gate, "echo", json!({"hi": 1}), None).await?;
//!         println!("gate answered {}", reply);
//!     }
//!
//!     mesh.shutdown().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod edge;
pub mod error;
pub mod link;
pub mod listener;
pub mod mesh;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;

pub use codec::Codec;
pub use config::{LinkOptions, MeshConfig, PoolOptions};
pub use context::MeshContext;
pub use edge::{EdgeClient, EdgeClients};
pub use error::{MeshError, Result};
pub use link::{
    Dispatch, HandlerModule, LinkEvent, LinkPhase, LinkRole, MessageId, PeerLink, RemoteRequest,
};
pub use listener::{MeshListener, MeshListenerHandle};
pub use mesh::{Mesh, MeshBuilder};
pub use pool::LinkPool;
pub use registry::{
    DispatchFn, MemoryStorage, PeerRegistry, RegistryOptions, ServerStatus, ServerStorage,
    SqliteStorage,
};
pub use retry::{retry_async, RetryPolicy, RetryStats};
pub use server::{ServerDescriptor, ServerMap};
pub use session::{SaveMode, SessionToken, SessionWire};
