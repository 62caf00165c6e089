//! Per-port policy listener.
//!
//! One `PolicyServer` owns one listening socket and one accept task. The
//! accept task hands every connection to whichever pool is currently
//! active; reload swaps pools underneath the running listeners without
//! touching them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::controller::ActivePool;
use crate::plugins::Plugin;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

pub struct PolicyServer {
    id: u64,
    port: u16,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PolicyServer {
    /// Bind `(address, port)` with `SO_REUSEADDR` and backlog 5, then start
    /// the accept task. Port 0 picks an ephemeral port, see
    /// [`PolicyServer::local_addr`].
    pub async fn start(
        address: &str,
        port: u16,
        config: Arc<Config>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
        pool: Arc<ActivePool>,
    ) -> anyhow::Result<Self> {
        let ip: std::net::IpAddr = address
            .parse()
            .with_context(|| format!("invalid bind address '{address}'"))?;
        let addr = SocketAddr::new(ip, port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("could not create listener socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("could not start incoming policy server on {addr}"))?;
        let listener = socket.listen(5)?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            cancel.clone(),
            config,
            plugins,
            pool,
        ));
        tracing::info!(port = local_addr.port(), "policy server running");

        Ok(PolicyServer {
            id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
            port: local_addr.port(),
            local_addr,
            cancel,
            handle,
        })
    }

    /// Stable identity of this listener, used to verify that reload keeps
    /// unchanged ports running on their original instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept task to finish. Sessions
    /// already handed to a pool are unaffected.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    config: Arc<Config>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    pool: Arc<ActivePool>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "incoming connection");
                    // Blocks when the pool queue is full; backpressure is
                    // the load-shedding mechanism.
                    pool.dispatch(stream, Arc::clone(&config), Arc::clone(&plugins)).await;
                }
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                }
            }
        }
    }
    tracing::debug!(port = listener.local_addr().map(|a| a.port()).unwrap_or(0), "listener stopped");
}
