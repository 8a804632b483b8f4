//! Wire format shared by both link roles.
//!
//! Every frame is a 4-byte big-endian length prefix, a one-byte frame kind,
//! then the body. Data bodies are codec-encoded JSON envelopes; ping and
//! pong frames have empty bodies.
//!
//! ```text
//! [u32 BE: len][u8 kind][body of len - 1 bytes]
//! ```

use crate::config::LinkConfig;
use crate::session::SessionWire;
use crate::{MeshError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reserved action names. None of them may be bound by a user handler.
pub mod native {
    pub const SERVER_INFO: &str = "_serverinfo";
    pub const CLOSE_SOCKET: &str = "_close";
    pub const SYNC_SESSION: &str = "_syncsession";
    pub const SAVE_SESSION: &str = "_savesession";
    pub const PUSH_MESSAGE: &str = "_pushmessage";
    pub const CLIENT_DISCONNECT: &str = "_disconnect";
    /// Action of a correlated failure reply.
    pub const ERROR: &str = "error";

    pub const ALL: [&str; 7] = [
        SERVER_INFO,
        CLOSE_SOCKET,
        SYNC_SESSION,
        SAVE_SESSION,
        PUSH_MESSAGE,
        CLIENT_DISCONNECT,
        ERROR,
    ];

    pub fn is_reserved(action: &str) -> bool {
        ALL.contains(&action)
    }

    /// Session actions fulfilled against the local edge rather than a user handler.
    pub fn is_edge_action(action: &str) -> bool {
        matches!(
            action,
            SYNC_SESSION | SAVE_SESSION | PUSH_MESSAGE | CLIENT_DISCONNECT
        )
    }
}

/// `errCode` values of close-notification payloads.
pub mod close_code {
    pub const REPEAT_CONNECT: u32 = 8;
    pub const HEARTBEAT_TIMEOUT: u32 = 9;
}

/// Payload of a `_close` notification.
pub fn close_payload(code: u32, message: &str) -> serde_json::Value {
    serde_json::json!({ "errCode": code, "errMsg": message })
}

/// Lower-case every object key, recursively.
pub fn lowercase_keys(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Kind byte of a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data = 0x01,
    Ping = 0x02,
    Pong = 0x03,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Ping),
            0x03 => Some(Self::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn data(body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Data,
            body,
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: FrameKind::Ping,
            body: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: FrameKind::Pong,
            body: Vec::new(),
        }
    }
}

/// Correlation id of an envelope. `0` means fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Num(u64),
    Str(String),
}

impl MessageId {
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, MessageId::Num(0))
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            MessageId::Str(s) => Some(s),
            MessageId::Num(_) => None,
        }
    }
}

impl Default for MessageId {
    fn default() -> Self {
        MessageId::Num(0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Num(n) => write!(f, "{}", n),
            MessageId::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Message envelope carried in every data frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: MessageId,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(
        default,
        rename = "frontsession",
        skip_serializing_if = "Option::is_none"
    )]
    pub session: Option<SessionWire>,
}

impl Envelope {
    pub fn new(id: MessageId, action: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            action: action.into(),
            payload,
            origin: None,
            session: None,
        }
    }

    /// Parse a decoded frame body. Envelopes without a string action are rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if !value.get("action").map(|a| a.is_string()).unwrap_or(false) {
            return Err(MeshError::invalid_params("envelope has no string action"));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Sink side of a link's transport.
#[async_trait::async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write(&mut self, frame: &Frame) -> Result<()>;

    async fn shutdown(&mut self);
}

/// [`FrameWriter`] over any async byte stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> FrameWriter for StreamWriter<W> {
    async fn write(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.inner, frame).await
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Read one frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(MeshError::invalid_params("empty frame"));
    }
    if len > LinkConfig::MAX_FRAME_SIZE {
        return Err(MeshError::invalid_params(format!(
            "frame size {} exceeds maximum {}",
            len,
            LinkConfig::MAX_FRAME_SIZE
        )));
    }

    let kind = reader.read_u8().await?;
    let mut body = vec![0u8; len - 1];
    reader.read_exact(&mut body).await?;

    let kind = FrameKind::from_u8(kind)
        .ok_or_else(|| MeshError::invalid_params(format!("unknown frame kind {:#04x}", kind)))?;
    Ok(Some(Frame { kind, body }))
}

/// Write one frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = (frame.body.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_u8(frame.kind as u8).await?;
    writer.write_all(&frame.body).await?;
    writer.flush().await?;
    Ok(())
}
