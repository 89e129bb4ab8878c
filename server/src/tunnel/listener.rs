//! Accept loop for the mTLS tunnel listener (§4.4, §6.2).
//!
//! Grounded on `aether-proxy::proxy::server::run`'s accept loop shape
//! (bind, select between `listener.accept()` and a shutdown signal, spawn a
//! task per connection), simplified because a Fluidity server expects one
//! agent's tunnel at a time: accepting a second connection while the first
//! is live replaces it, rather than fanning out like the teacher's
//! many-clients HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::ServerContext;
use crate::tls;
use crate::tunnel::transport;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn run(ctx: Arc<ServerContext>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let acceptor = tls::build_tunnel_acceptor(&ctx.config).context("building tunnel TLS acceptor")?;
    let addr: SocketAddr = ctx
        .config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", ctx.config.bind_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding tunnel listener on {addr}"))?;
    info!(%addr, "tunnel listener bound");

    let mut active: Option<transport::Tunnel> = None;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(error = %err, "failed to accept tunnel connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "tunnel connection accepted");

                if ctx.config.tcp_nodelay {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
                    }
                }

                let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(err)) => {
                        warn!(peer = %peer_addr, error = %err, "tunnel TLS handshake failed");
                        continue;
                    }
                    Err(_) => {
                        warn!(peer = %peer_addr, "tunnel TLS handshake timed out");
                        continue;
                    }
                };

                if let Some(previous) = active.take() {
                    info!(peer = %peer_addr, "new tunnel replacing previous one");
                    previous.shutdown();
                }

                match transport::serve(tls_stream, ctx.clone()).await {
                    Ok(tunnel) => {
                        info!(peer = %peer_addr, "tunnel established");
                        active = Some(tunnel);
                    }
                    Err(err) => {
                        warn!(peer = %peer_addr, error = %err, "tunnel handshake failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("tunnel listener shutting down");
                if let Some(tunnel) = active.take() {
                    tunnel.shutdown();
                }
                break;
            }
        }
    }

    Ok(())
}
