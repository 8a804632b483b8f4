//! Built-in handlers for the session actions, fulfilled against the local
//! edge server.

use super::protocol::{native, MessageId};
use super::request::RemoteRequest;
use crate::edge::EdgeClients;
use crate::session::SaveMode;
use crate::{MeshError, Result};
use serde_json::{json, Value};
use tracing::debug;

fn cid_of(req: &RemoteRequest) -> Option<String> {
    match req.payload().get("cid")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn no_client() -> Value {
    json!({ "status": "error", "errMsg": "no client" })
}

/// Serve one session action. `Ok(Value::Null)` means nothing to answer.
pub(crate) async fn serve(edge: &dyn EdgeClients, req: &RemoteRequest) -> Result<Value> {
    let client = cid_of(req).and_then(|cid| edge.get_client(&cid));

    match req.action() {
        native::SYNC_SESSION => Ok(match client {
            Some(client) => json!({ "status": "ok", "session": client.session() }),
            None => no_client(),
        }),
        native::SAVE_SESSION => {
            let Some(client) = client else {
                return Ok(no_client());
            };
            let mode: SaveMode = req
                .payload()
                .get("mode")
                .cloned()
                .and_then(|m| serde_json::from_value(m).ok())
                .unwrap_or_default();
            client.set_session(req.session().snapshot(), mode == SaveMode::Cover);
            Ok(json!({ "status": "ok", "session": client.session() }))
        }
        native::PUSH_MESSAGE => {
            let Some(client) = client else {
                debug!("Push for unknown client dropped");
                return Ok(Value::Null);
            };
            let payload = req.payload();
            let action = payload
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| MeshError::invalid_params("push message without action"))?;
            let id = payload
                .get("id")
                .cloned()
                .and_then(|id| serde_json::from_value::<MessageId>(id).ok())
                .unwrap_or_default();
            let body = payload.get("payload").cloned().unwrap_or(Value::Null);
            client.send(action, body, id).await?;
            Ok(Value::Null)
        }
        native::CLIENT_DISCONNECT => {
            let Some(client) = client else {
                return Ok(no_client());
            };
            let reason = req.payload().get("reason").cloned().unwrap_or(Value::Null);
            client.close(reason).await;
            Ok(json!({ "status": "ok" }))
        }
        other => Err(MeshError::InvalidFunction {
            action: other.to_string(),
        }),
    }
}
