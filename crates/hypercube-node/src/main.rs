//! Hypercube Node - standalone mesh server.
//!
//! Runs one mesh node backed by the shared SQLite server directory, serving
//! `echo` and `ping` until Ctrl-C.

mod handlers;

use anyhow::{Context, Result};
use clap::Parser;
use hypercube_core::{Mesh, MeshConfig, ServerDescriptor, SqliteStorage};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hypercube-node")]
#[command(about = "Inter-server RPC mesh node")]
struct Args {
    /// Mesh configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server id, unique within its group
    #[arg(long)]
    id: String,

    /// Server group
    #[arg(short, long)]
    group: String,

    /// Host peers use to reach this node
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for peer links (0 = auto-assign)
    #[arg(short = 'p', long, default_value = "0")]
    remote_port: u16,

    /// Groups to keep connected
    #[arg(short, long, num_args = 1..)]
    remain: Vec<String>,

    /// Shared server directory
    #[arg(long, default_value = "hypercube-servers.db")]
    db: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    let Some(path) = path else {
        return Ok(MeshConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Hypercube node {}#{}", args.group, args.id);

    let config = load_config(args.config.as_deref())?;
    let storage = SqliteStorage::open_at(&args.db)
        .with_context(|| format!("opening server directory {}", args.db.display()))?;
    let local = ServerDescriptor::new(args.id, args.group, args.host).with_remote_port(args.remote_port);

    let mesh = Mesh::builder(local)
        .config(config)
        .storage(storage)
        .handler(handlers::node_handlers()?)
        .remain(args.remain)
        .build()
        .await?;

    if let Some(addr) = mesh.listen_addr() {
        // Intentional stdout so scripts can pick up an auto-assigned port
        println!("MESH_PORT={}", addr.port());
    }
    info!("Node {} running", mesh.local());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    mesh.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_means_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.remain.is_empty());
        assert!(!config.auto_sync);
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mesh.json");
        std::fs::write(
            &path,
            r#"{"remain": ["lobby"], "autoSync": true, "syncInterval": 1000, "link": {"requestTimeout": 5000}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.remain, vec!["lobby".to_string()]);
        assert!(config.auto_sync);
        assert_eq!(config.sync_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.link.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mesh.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("parsing config"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "hypercube-node",
            "--id",
            "2",
            "--group",
            "gate",
            "--remain",
            "lobby",
            "chat",
        ])
        .unwrap();
        assert_eq!(args.remain, vec!["lobby", "chat"]);
        assert_eq!(args.remote_port, 0);
        assert_eq!(args.host, "127.0.0.1");
    }
}
