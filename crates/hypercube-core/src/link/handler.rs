//! Action dispatch for incoming messages.

use super::protocol::native;
use super::request::RemoteRequest;
use crate::{MeshError, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Something that can serve actions arriving on a link.
///
/// Returning `Ok(value)` settles the request (a non-null value doubles as
/// the response); returning `Err` sends an `"error"` reply.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    fn handles(&self, action: &str) -> bool;

    async fn dispatch(&self, req: RemoteRequest) -> Result<Value>;
}

/// Bound async handler function.
pub type HandlerFn = Arc<dyn Fn(RemoteRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Action name to handler map, fixed at registration.
#[derive(Clone, Default)]
pub struct HandlerModule {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `action` to `handler`. Reserved action names are rejected.
    pub fn route<F, Fut>(mut self, action: &str, handler: F) -> Result<Self>
    where
        F: Fn(RemoteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        if action.is_empty() || native::is_reserved(action) {
            return Err(MeshError::invalid_params(format!(
                "action name [{}] is reserved",
                action
            )));
        }
        let handler: HandlerFn = Arc::new(move |req| Box::pin(handler(req)));
        self.handlers.insert(action.to_string(), handler);
        Ok(self)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[async_trait::async_trait]
impl Dispatch for HandlerModule {
    fn handles(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    async fn dispatch(&self, req: RemoteRequest) -> Result<Value> {
        let handler = self
            .handlers
            .get(req.action())
            .cloned()
            .ok_or_else(|| MeshError::InvalidFunction {
                action: req.action().to_string(),
            })?;
        handler(req).await
    }
}
