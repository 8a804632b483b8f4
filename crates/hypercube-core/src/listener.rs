//! TCP listener for peer servers.
//!
//! Accepts connections on the remote port and hands each one to the pool as
//! an inbound link. Links accepted here are closed when the listener shuts
//! down.

use crate::config::ListenerConfig;
use crate::link::PeerLink;
use crate::pool::LinkPool;
use crate::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Handle to a running listener. Dropping shuts it down.
pub struct MeshListenerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MeshListenerHandle {
    /// Address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and close the links accepted so far.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Shut down and wait until the accepted links are closed.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for MeshListenerHandle {
    fn drop(&mut self) {
        // The accept loop is detached and finishes closing its links.
        self.shutdown();
    }
}

/// Listener for inbound peer links.
pub struct MeshListener;

impl MeshListener {
    /// Bind `host:port` with the default connection limit. Port 0 picks a
    /// free port; see [`MeshListenerHandle::port`].
    pub async fn bind(host: &str, port: u16, pool: LinkPool) -> Result<MeshListenerHandle> {
        Self::bind_with_limit(host, port, pool, ListenerConfig::MAX_CONNECTIONS).await
    }

    pub async fn bind_with_limit(
        host: &str,
        port: u16,
        pool: LinkPool,
        max_connections: usize,
    ) -> Result<MeshListenerHandle> {
        let listener = TcpListener::bind((host, port)).await?;
        Self::serve(listener, pool, max_connections)
    }

    /// Serve an already bound socket.
    pub fn serve(
        listener: TcpListener,
        pool: LinkPool,
        max_connections: usize,
    ) -> Result<MeshListenerHandle> {
        let addr = listener.local_addr()?;
        info!("Mesh listener on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_handle = tokio::spawn(Self::accept_loop(listener, pool, shutdown_rx, max_connections));

        Ok(MeshListenerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        pool: LinkPool,
        mut shutdown_rx: oneshot::Receiver<()>,
        max_connections: usize,
    ) {
        let mut accepted: Vec<PeerLink> = Vec::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Mesh listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            accepted.retain(|link| !link.is_closed());
                            if accepted.len() >= max_connections {
                                warn!(
                                    "Rejecting peer connection from {}: at max capacity ({})",
                                    peer_addr, max_connections
                                );
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
                            }
                            debug!("Peer connection from {}", peer_addr);
                            accepted.push(pool.add_inbound_link(stream));
                        }
                        Err(e) => {
                            error!("Mesh accept error: {}", e);
                        }
                    }
                }
            }
        }

        futures::future::join_all(accepted.iter().map(|link| link.close(false, None))).await;
    }
}
