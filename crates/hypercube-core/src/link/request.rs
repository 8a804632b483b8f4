//! The object a handler receives for one incoming message.
//!
//! A handler answers through [`RemoteRequest::response`] (any number of
//! times; repeated calls for the same action merge objects) and may queue
//! messages for the origin edge client with `front_push`/`front_error`.
//! Everything is flushed when the request settles. Settling happens once:
//! the handler's return value and an explicit `close`/`error` race through a
//! single-assignment cell.

use super::peer_link::PeerLink;
use super::protocol::{native, MessageId};
use crate::context::MeshContext;
use crate::server::ServerDescriptor;
use crate::session::SessionToken;
use crate::{MeshError, Result};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

/// How a request settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Closed(Value),
    /// Payload of the `"error"` reply.
    Failed(Value),
}

#[derive(Default)]
struct Replies {
    responses: Vec<(String, Value)>,
    front: Vec<(String, Value)>,
}

struct RequestInner {
    id: MessageId,
    action: String,
    payload: Value,
    origin: Option<String>,
    session: SessionToken,
    link: PeerLink,
    replies: Mutex<Replies>,
    outcome: OnceLock<Outcome>,
}

/// Incoming message bound to the link it arrived on. Clones share state.
#[derive(Clone)]
pub struct RemoteRequest {
    inner: Arc<RequestInner>,
}

fn merge_into(slot: &mut Value, incoming: Value) {
    match (slot, incoming) {
        (Value::Object(current), Value::Object(extra)) => current.extend(extra),
        (slot, incoming) => *slot = incoming,
    }
}

fn upsert(entries: &mut Vec<(String, Value)>, action: &str, payload: Value, first: impl FnOnce(Value) -> Value) {
    match entries.iter_mut().find(|(a, _)| a == action) {
        Some((_, existing)) => merge_into(existing, payload),
        None => entries.push((action.to_string(), first(payload))),
    }
}

fn with_status(status: &str, payload: Value) -> Value {
    match payload {
        Value::Object(extra) => {
            let mut base = json!({ "status": status });
            merge_into(&mut base, Value::Object(extra));
            base
        }
        other => other,
    }
}

impl RemoteRequest {
    pub(crate) fn new(
        link: PeerLink,
        id: MessageId,
        action: String,
        payload: Value,
        origin: Option<String>,
        session: SessionToken,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id,
                action,
                payload,
                origin,
                session,
                link,
                replies: Mutex::new(Replies::default()),
                outcome: OnceLock::new(),
            }),
        }
    }

    fn replies(&self) -> MutexGuard<'_, Replies> {
        self.inner.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &MessageId {
        &self.inner.id
    }

    pub fn action(&self) -> &str {
        &self.inner.action
    }

    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Group of the sending server, as it announced it.
    pub fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    /// Token carried by the message; a local token when none was attached.
    pub fn session(&self) -> &SessionToken {
        &self.inner.session
    }

    pub fn link(&self) -> &PeerLink {
        &self.inner.link
    }

    /// Descriptor of the server that sent this message, once known.
    pub fn peer(&self) -> Option<ServerDescriptor> {
        self.inner.link.peer()
    }

    pub fn context(&self) -> Result<MeshContext> {
        self.inner.link.context()
    }

    /// Queue a reply. `action` defaults to the request's own action.
    pub fn response(&self, payload: Value, action: Option<&str>) {
        let action = action.unwrap_or(&self.inner.action);
        upsert(&mut self.replies().responses, action, payload, |p| p);
    }

    fn has_response(&self, action: &str) -> bool {
        self.replies().responses.iter().any(|(a, _)| a == action)
    }

    /// Queue a message for the origin edge client. Defaults to `{status: "ok"}`.
    pub fn front_push(&self, action: &str, payload: Option<Value>) {
        let payload = payload.unwrap_or_else(|| json!({ "status": "ok" }));
        upsert(&mut self.replies().front, action, payload, |p| with_status("ok", p));
    }

    /// Queue a failure notice for the origin edge client.
    pub fn front_error(&self, action: &str, error: Value) {
        upsert(&mut self.replies().front, action, error, |p| with_status("error", p));
    }

    /// Send a message to the peer under this request's id.
    pub async fn send(&self, action: &str, payload: Value) -> Result<()> {
        self.inner
            .link
            .send(action, payload, Some(&self.inner.session), self.inner.id.clone())
            .await
    }

    /// Push straight to the origin edge client.
    pub async fn push_message(&self, action: &str, payload: Value) -> Result<()> {
        let ctx = self.context()?;
        self.inner
            .session
            .push_message(&ctx, action, payload, self.inner.id.clone())
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.inner.outcome.get()
    }

    /// Settle successfully and flush queued replies. No-op once settled.
    pub async fn close(&self, result: Value) {
        if self.inner.outcome.set(Outcome::Closed(result)).is_err() {
            return;
        }
        let (responses, front) = {
            let mut replies = self.replies();
            (
                std::mem::take(&mut replies.responses),
                std::mem::take(&mut replies.front),
            )
        };

        if self.inner.id.is_fire_and_forget() {
            if !responses.is_empty() {
                debug!(
                    "Dropping {} responses to fire-and-forget {}",
                    responses.len(),
                    self.inner.action
                );
            }
        } else {
            for (action, payload) in responses {
                if let Err(e) = self.send(&action, payload).await {
                    warn!("Failed to answer {} [{}]: {}", self.inner.action, self.inner.id, e);
                }
            }
        }

        if front.is_empty() {
            return;
        }
        let ctx = match self.context() {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Dropping {} front messages: {}", front.len(), e);
                return;
            }
        };
        for (action, payload) in front {
            if let Err(e) = self
                .inner
                .session
                .push_message(&ctx, &action, payload, self.inner.id.clone())
                .await
            {
                warn!("Front push {} failed: {}", action, e);
            }
        }
    }

    /// Settle with a failure; correlated callers get an `"error"` reply.
    pub async fn error(&self, err: MeshError) {
        let payload = err.to_reply_payload();
        if self.inner.outcome.set(Outcome::Failed(payload.clone())).is_err() {
            return;
        }
        warn!("Handler {} [{}] failed: {}", self.inner.action, self.inner.id, err);
        if self.inner.id.is_fire_and_forget() {
            return;
        }
        if let Err(e) = self.send(native::ERROR, payload).await {
            debug!("Could not deliver error reply: {}", e);
        }
    }

    /// Settle with a handler's return value. A non-null value counts as the
    /// response to the request's own action unless one was given already.
    pub(crate) async fn finish(&self, result: Result<Value>) {
        match result {
            Ok(value) => {
                if !value.is_null() && !self.is_closed() && !self.has_response(&self.inner.action) {
                    self.response(value.clone(), None);
                }
                self.close(value).await;
            }
            Err(e) => self.error(e).await,
        }
    }
}

impl std::fmt::Debug for RemoteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRequest")
            .field("id", &self.inner.id)
            .field("action", &self.inner.action)
            .field("closed", &self.is_closed())
            .finish()
    }
}
