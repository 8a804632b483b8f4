//! Identity of an edge client carried through inter-server calls.
//!
//! A token names the server the client is connected to (`sid`/`sgroup`) and
//! the client itself (`cid`). Any server holding a complete token can reach
//! back to that origin server to read or write the client's session, push it
//! a message, or disconnect it.

use crate::context::MeshContext;
use crate::link::{native, MessageId};
use crate::server::{opt_string_or_number, ServerDescriptor};
use crate::{MeshError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// `frontsession` object of the wire envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionWire {
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sgroup: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub cid: Option<String>,
    #[serde(default, deserialize_with = "map_or_null")]
    pub session: Map<String, Value>,
}

fn map_or_null<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// How `save` writes the carried session into the origin client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Merge into the client's session.
    #[default]
    Append,
    /// Replace the client's session.
    Cover,
}

impl SaveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveMode::Append => "append",
            SaveMode::Cover => "cover",
        }
    }
}

/// Client identity plus a session data bag shared by all clones.
///
/// The default token is local: it has no identity.
#[derive(Debug, Clone, Default)]
pub struct SessionToken {
    sid: Option<String>,
    sgroup: Option<String>,
    cid: Option<String>,
    data: Arc<Mutex<Map<String, Value>>>,
}

impl SessionToken {
    /// Complete token for client `cid` connected to `sgroup#sid`.
    pub fn new(sid: impl Into<String>, sgroup: impl Into<String>, cid: impl Into<String>) -> Self {
        Self {
            sid: Some(sid.into()),
            sgroup: Some(sgroup.into()),
            cid: Some(cid.into()),
            data: Arc::default(),
        }
    }

    /// Token rebuilt from the wire. Missing parts make it a local token.
    pub fn from_wire(wire: SessionWire) -> Self {
        Self {
            sid: wire.sid,
            sgroup: wire.sgroup,
            cid: wire.cid,
            data: Arc::new(Mutex::new(wire.session)),
        }
    }

    /// Token with session data, for builders and tests.
    pub fn with_session(self, session: Map<String, Value>) -> Self {
        *self.lock() = session;
        self
    }

    /// `false` when any of sid, sgroup or cid is missing. Remote operations
    /// on such a token fail with [`MeshError::NoCreate`].
    pub fn is_created(&self) -> bool {
        self.sid.is_some() && self.sgroup.is_some() && self.cid.is_some()
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn sgroup(&self) -> Option<&str> {
        self.sgroup.as_deref()
    }

    pub fn cid(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `values` into the session, or replace it when `cover` is set.
    pub fn set(&self, values: Value, cover: bool) -> Result<()> {
        let Value::Object(values) = values else {
            return Err(MeshError::invalid_params("session values must be an object"));
        };
        let mut data = self.lock();
        if cover {
            data.clear();
        }
        data.extend(values);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Copy of the whole session.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    /// Remove one key, or everything when `key` is `None`.
    pub fn del(&self, key: Option<&str>) {
        let mut data = self.lock();
        match key {
            Some(key) => {
                data.remove(key);
            }
            None => data.clear(),
        }
    }

    /// Wire form; local tokens are not sent.
    pub fn to_wire(&self) -> Option<SessionWire> {
        if !self.is_created() {
            return None;
        }
        Some(SessionWire {
            sid: self.sid.clone(),
            sgroup: self.sgroup.clone(),
            cid: self.cid.clone(),
            session: self.snapshot(),
        })
    }

    fn identity(&self) -> Result<(&str, &str, &str)> {
        match (&self.sid, &self.sgroup, &self.cid) {
            (Some(sid), Some(sgroup), Some(cid)) => Ok((sid, sgroup, cid)),
            _ => Err(MeshError::NoCreate),
        }
    }

    fn origin(&self, ctx: &MeshContext) -> Result<ServerDescriptor> {
        let (sid, sgroup, _) = self.identity()?;
        ctx.registry()
            .get_server(sgroup, Some(self), Some(sid))
            .ok_or_else(|| {
                MeshError::invalid_params(format!("origin server {}#{} is not registered", sgroup, sid))
            })
    }

    fn apply_reply(&self, reply: Value) -> Result<()> {
        if reply.get("status").and_then(Value::as_str) != Some("ok") {
            return Err(MeshError::Remote { payload: reply });
        }
        let session = reply.get("session").cloned().unwrap_or_else(|| json!({}));
        self.set(session, true)
    }

    /// Replace the local session with the origin client's.
    pub async fn sync(&self, ctx: &MeshContext) -> Result<()> {
        let (_, _, cid) = self.identity()?;
        let payload = json!({ "cid": cid });
        let origin = self.origin(ctx)?;
        let reply = ctx
            .pool()
            .request(&origin, native::SYNC_SESSION, payload, Some(self))
            .await?;
        self.apply_reply(reply)
    }

    /// Write the local session into the origin client, then adopt the
    /// result.
    pub async fn save(&self, ctx: &MeshContext, mode: SaveMode) -> Result<()> {
        let (_, _, cid) = self.identity()?;
        let payload = json!({ "mode": mode.as_str(), "cid": cid });
        let origin = self.origin(ctx)?;
        let reply = ctx
            .pool()
            .request(&origin, native::SAVE_SESSION, payload, Some(self))
            .await?;
        self.apply_reply(reply)
    }

    /// Have the origin server deliver `action` to the client.
    pub async fn push_message(
        &self,
        ctx: &MeshContext,
        action: &str,
        payload: Value,
        id: MessageId,
    ) -> Result<()> {
        let (_, _, cid) = self.identity()?;
        let payload = json!({ "id": id, "action": action, "payload": payload, "cid": cid });
        let origin = self.origin(ctx)?;
        ctx.pool()
            .push(&origin, native::PUSH_MESSAGE, payload, Some(self))
            .await
    }

    /// Ask the origin server to disconnect the client. `true` when it did.
    pub async fn disconnect(&self, ctx: &MeshContext, reason: Value) -> Result<bool> {
        let (_, _, cid) = self.identity()?;
        let payload = json!({ "cid": cid, "reason": reason });
        let origin = self.origin(ctx)?;
        let reply = ctx
            .pool()
            .request(&origin, native::CLIENT_DISCONNECT, payload, Some(self))
            .await?;
        Ok(reply.get("status").and_then(Value::as_str) == Some("ok"))
    }
}
