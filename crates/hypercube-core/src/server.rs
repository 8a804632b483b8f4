//! Server descriptors: the immutable identity of one mesh process.

use crate::{MeshError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Snapshot of servers keyed by group, as returned by storage.
pub type ServerMap = BTreeMap<String, Vec<ServerDescriptor>>;

/// Identity of a server process, unique per `(group, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub group: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub name: String,
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, group: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            host: host.into(),
            client_port: None,
            remote_port: None,
            http_port: None,
            name: String::new(),
        }
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn with_client_port(mut self, port: u16) -> Self {
        self.client_port = Some(port);
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Check that the descriptor can identify a running process.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.group.is_empty() || self.host.is_empty() {
            return Err(MeshError::invalid_params(
                "server descriptor needs a non-empty id, group and host",
            ));
        }
        if self.client_port.is_none() && self.remote_port.is_none() && self.http_port.is_none() {
            return Err(MeshError::invalid_params(format!(
                "server {} has no client, remote or http port",
                self.key()
            )));
        }
        Ok(())
    }

    /// `host:remotePort` address peers dial to reach this server.
    pub fn remote_addr(&self) -> Result<String> {
        let port = self.remote_port.ok_or_else(|| {
            MeshError::invalid_params(format!("server {} has no remote port", self.key()))
        })?;
        Ok(format!("{}:{}", self.host, port))
    }

    /// `group#id`, used in logs and correlation ids.
    pub fn key(&self) -> String {
        format!("{}#{}", self.group, self.id)
    }
}

impl std::fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.group, self.id, self.host)
    }
}

/// Accept ids written either as JSON strings or numbers.
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

/// Optional variant of [`string_or_number`]; `null` reads as `None`.
pub(crate) fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    }))
}
