//! Startup and shutdown orchestration (§4.8).
//!
//! Grounded on `aether-proxy`'s top-level `run` loop (register, then accept
//! connections until a shutdown signal, then unregister), generalized from
//! a register-once/reconnect-forever cycle to fluidity's Wake, Query-poll,
//! open-tunnel, serve, Kill sequence. Per the Design Notes' resolved open
//! question, a lost tunnel after a successful start is treated as fatal:
//! this process exits rather than attempting to re-Wake.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fluidity_protocol::SessionRegistry;
use rustls_pki_types::ServerName;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::lifecycle::client::LifecycleClient;
use crate::proxy;
use crate::state::AgentContext;
use crate::tls::build_connector;
use crate::tunnel::{self, OpenParams};

/// How often the session registry is swept for expired deadlines (§4.2,
/// spec line 161: a session past its deadline must resolve as `Timeout`
/// even if no further envelope ever arrives for it).
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Run the agent to completion: Wake, wait for the server to report ready,
/// open the tunnel, serve local proxy traffic until interrupted, then tear
/// everything down. Returns once shutdown has finished.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let lifecycle = LifecycleClient::new(config.clone())?;

    info!("waking server");
    let wake = tokio::time::timeout(
        Duration::from_secs(config.wake_timeout_secs),
        lifecycle.wake(),
    )
    .await
    .context("wake timed out")?
    .context("wake failed")?;
    info!(server_address = %wake.server_address, server_identity = %wake.server_identity, "wake succeeded");

    info!("waiting for server to report ready");
    let query = lifecycle
        .query_until_ready()
        .await
        .context("query polling failed")?;
    info!("server reports ready");

    let connector = build_connector(&config)?;
    let registry = Arc::new(SessionRegistry::new());

    let server_addr = query
        .server_address
        .to_socket_addrs()
        .with_context(|| format!("resolving server address {}", query.server_address))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("server address {} resolved to nothing", query.server_address))?;
    let host_only = query
        .server_address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&query.server_address);
    let server_name = ServerName::try_from(host_only.to_string())
        .with_context(|| format!("invalid server DNS name {host_only}"))?;

    info!(%server_addr, "opening tunnel");
    let tunnel = tunnel::open(
        &connector,
        OpenParams {
            server_addr,
            server_name,
            expected_identity: &query.server_identity,
            tcp_nodelay: config.tcp_nodelay,
            read_idle_timeout: Duration::from_secs(config.read_idle_timeout_secs),
            outbound_queue_capacity: config.stream_queue_capacity,
            registry: registry.clone(),
            test_mode: config.test_mode,
            access_key_id: &config.access_key_id,
            secret_key: config.secret_key.as_bytes(),
            region: &config.region,
            service: &config.service,
            peer_auth_timeout: Duration::from_secs(config.peer_auth_timeout_secs),
        },
    )
    .await
    .context("opening tunnel failed")?;
    info!("tunnel established");

    let mut tunnel_state = tunnel.state.clone();
    let ctx = Arc::new(AgentContext::new(tunnel, registry.clone(), config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_ctx = ctx.clone();
    let proxy_task = tokio::spawn(async move { proxy::run(proxy_ctx, shutdown_rx).await });

    let sweep_registry = registry.clone();
    let mut sweep_shutdown = shutdown_tx.subscribe();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => sweep_registry.expire_due(),
                _ = sweep_shutdown.changed() => break,
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        changed = tunnel_state.changed() => {
            if changed.is_ok() && *tunnel_state.borrow() == tunnel::TunnelState::Lost {
                error!("tunnel lost; exiting");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    registry.cancel_all(fluidity_protocol::SessionError::Shutdown);
    ctx.tunnel.shutdown();

    if let Err(err) = proxy_task.await {
        error!(error = %err, "proxy listener task panicked");
    }
    let _ = sweep_task.await;

    info!("notifying control plane of shutdown");
    lifecycle.kill().await;

    Ok(())
}
