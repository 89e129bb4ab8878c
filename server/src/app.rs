//! Startup and shutdown orchestration (§4.6, §6.5): bind the tunnel
//! listener and the health listener, run until a shutdown signal, then
//! drain outstanding sessions.
//!
//! Grounded on `aether-proxy::proxy::server::run`'s bind-then-select
//! shape, split into two independently bound listeners per §6.4's
//! requirement that the health port be distinct from the tunnel port.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use reqwest::dns::Resolve;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::safe_dns::SafeDnsResolver;
use crate::state::ServerContext;
use crate::target_filter::DnsCache;
use crate::{health, tls, tunnel};

/// How often the session registry is swept for expired deadlines (§4.2,
/// spec line 161: a session past its deadline must resolve as `Timeout`
/// even if no further envelope ever arrives for it).
const SESSION_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

pub async fn run(config: Config) -> anyhow::Result<()> {
    if let Err(err) = tls::ensure_self_signed_cert(
        Path::new(&config.health_tls_cert_path),
        Path::new(&config.health_tls_key_path),
    ) {
        warn!(error = %err, "failed to bootstrap health listener certificate; continuing without it");
    }

    let dns_cache = Arc::new(DnsCache::new(
        std::time::Duration::from_secs(config.dns_cache_ttl_secs),
        config.dns_cache_capacity,
    ));

    let resolver: Arc<dyn Resolve> = Arc::new(SafeDnsResolver::new(dns_cache.clone()));
    let http_client = reqwest::Client::builder()
        .dns_resolver(resolver)
        .timeout(std::time::Duration::from_secs(config.outbound_http_timeout_secs))
        .build()
        .context("building outbound HTTP client")?;

    let ctx = Arc::new(ServerContext::new(config.clone(), http_client, dns_cache));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tunnel_ctx = ctx.clone();
    let tunnel_shutdown = shutdown_rx.clone();
    let tunnel_task = tokio::spawn(async move { tunnel::listener::run(tunnel_ctx, tunnel_shutdown).await });

    let health_ctx = ctx.clone();
    let health_shutdown = shutdown_rx.clone();
    let health_task = tokio::spawn(async move { health::run(health_ctx, health_shutdown).await });

    let sweep_ctx = ctx.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => sweep_ctx.registry.expire_due(),
                _ = sweep_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("received interrupt, shutting down");
    let _ = shutdown_tx.send(true);

    let _ = sweep_task.await;
    let (tunnel_result, health_result) = tokio::join!(tunnel_task, health_task);
    if let Err(err) = tunnel_result.context("tunnel listener task panicked")? {
        error!(error = %err, "tunnel listener exited with error");
        return Err(err);
    }
    if let Err(err) = health_result.context("health listener task panicked")? {
        error!(error = %err, "health listener exited with error");
        return Err(err);
    }

    Ok(())
}
