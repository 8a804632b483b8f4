//! SQLite-backed server directory shared by every node on a host.

use super::storage::ServerStorage;
use super::PeerRegistry;
use crate::config::RegistryConfig;
use crate::server::{ServerDescriptor, ServerMap};
use crate::{MeshError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Lifecycle state of a row in the `servers` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// A peer's link to this server was destroyed.
    Removed = 0,
    Online = 1,
    /// The server announced its departure or was unreachable.
    Dropped = 2,
}

impl ServerStatus {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Removed),
            1 => Some(Self::Online),
            2 => Some(Self::Dropped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Removed => write!(f, "removed"),
            ServerStatus::Online => write!(f, "online"),
            ServerStatus::Dropped => write!(f, "dropped"),
        }
    }
}

/// Directory of servers in one SQLite file.
///
/// Uses WAL mode so several node processes can share the file, and
/// `Arc<Mutex<Connection>>` within a process. Queries run on the blocking
/// pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the directory at `db_path`.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| MeshError::Io {
                    message: format!("Failed to create storage directory: {}", parent.display()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        info!("Server directory opened at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private directory, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;",
            RegistryConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS servers (
                grp TEXT NOT NULL,
                id TEXT NOT NULL,
                host TEXT NOT NULL,
                client_port INTEGER,
                remote_port INTEGER,
                http_port INTEGER,
                name TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (grp, id)
            );",
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| MeshError::Storage {
                message: "Failed to acquire storage connection lock".to_string(),
                source: None,
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| MeshError::Other(format!("storage task failed: {}", e)))?
    }

    fn upsert_online(conn: &Connection, server: &ServerDescriptor) -> Result<()> {
        conn.execute(
            "INSERT INTO servers (grp, id, host, client_port, remote_port, http_port, name, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(grp, id) DO UPDATE SET
                host = excluded.host,
                client_port = excluded.client_port,
                remote_port = excluded.remote_port,
                http_port = excluded.http_port,
                name = excluded.name,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                server.group,
                server.id,
                server.host,
                server.client_port,
                server.remote_port,
                server.http_port,
                server.name,
                ServerStatus::Online as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn set_status(conn: &Connection, server: &ServerDescriptor, status: ServerStatus) -> Result<bool> {
        let rows = conn.execute(
            "UPDATE servers SET status = ?1, updated_at = ?2
             WHERE grp = ?3 AND id = ?4 AND status = ?5",
            params![
                status as i64,
                Utc::now().to_rfc3339(),
                server.group,
                server.id,
                ServerStatus::Online as i64,
            ],
        )?;
        Ok(rows > 0)
    }

    fn load_online(conn: &Connection) -> Result<ServerMap> {
        let mut stmt = conn.prepare(
            "SELECT grp, id, host, client_port, remote_port, http_port, name
             FROM servers WHERE status = ?1 ORDER BY grp, id",
        )?;
        let rows = stmt.query_map(params![ServerStatus::Online as i64], |row| {
            Ok(ServerDescriptor {
                group: row.get(0)?,
                id: row.get(1)?,
                host: row.get(2)?,
                client_port: row.get(3)?,
                remote_port: row.get(4)?,
                http_port: row.get(5)?,
                name: row.get(6)?,
            })
        })?;

        let mut servers = ServerMap::new();
        for row in rows {
            let server = row?;
            servers.entry(server.group.clone()).or_default().push(server);
        }
        Ok(servers)
    }

    /// Current status of one server, if it was ever recorded.
    pub async fn status(&self, group: &str, id: &str) -> Result<Option<ServerStatus>> {
        let (group, id) = (group.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let status: Option<i64> = conn
                .query_row(
                    "SELECT status FROM servers WHERE grp = ?1 AND id = ?2",
                    params![group, id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status.and_then(ServerStatus::from_i64))
        })
        .await
    }
}

#[async_trait::async_trait]
impl ServerStorage for SqliteStorage {
    async fn start(&self, registry: &PeerRegistry, local: &ServerDescriptor) -> Result<()> {
        let local = local.clone();
        let servers = self
            .with_conn(move |conn| {
                Self::upsert_online(conn, &local)?;
                Self::load_online(conn)
            })
            .await?;
        registry.sync(Some(servers)).await
    }

    async fn add(&self, _registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()> {
        let server = server.clone();
        self.with_conn(move |conn| Self::upsert_online(conn, &server)).await
    }

    async fn remove(&self, _registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()> {
        let server = server.clone();
        let changed = self
            .with_conn(move |conn| Self::set_status(conn, &server, ServerStatus::Removed))
            .await?;
        if changed {
            debug!("Marked server removed in directory");
        }
        Ok(())
    }

    async fn drop_server(&self, _registry: &PeerRegistry, server: &ServerDescriptor) -> Result<()> {
        let server = server.clone();
        let changed = self
            .with_conn(move |conn| Self::set_status(conn, &server, ServerStatus::Dropped))
            .await?;
        if changed {
            debug!("Marked server dropped in directory");
        }
        Ok(())
    }

    async fn get(&self) -> Result<ServerMap> {
        self.with_conn(Self::load_online).await
    }
}
