use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fluidity_protocol::{BreakerConfig, CircuitBreaker, SessionRegistry};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::target_filter::DnsCache;

/// In-process counters backing the health accessor (§6.4). Grounded on
/// `aether-proxy::state::ProxyMetrics`.
#[derive(Default)]
pub struct Metrics {
    last_activity_epoch_seconds: AtomicU64,
}

impl Metrics {
    pub fn record_activity(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_activity_epoch_seconds.store(now, Ordering::Relaxed);
    }

    pub fn last_activity_epoch_seconds(&self) -> u64 {
        self.last_activity_epoch_seconds.load(Ordering::Relaxed)
    }
}

/// Shared state for one agent's tunnel: the session registry (used only for
/// `ConnectStream`/`WebSocketStream` sessions that need follow-up envelope
/// routing via `deliver()`), a per-target circuit breaker (one entry per
/// target host, lazily created, per §4.3), the outbound `reqwest::Client`,
/// target filtering state, the concurrency-cap semaphore, and the health
/// accessor's metrics.
pub struct ServerContext {
    pub registry: Arc<SessionRegistry>,
    pub config: Config,
    pub http_client: reqwest::Client,
    pub dns_cache: Arc<DnsCache>,
    pub breakers: DashMap<String, Arc<CircuitBreaker>>,
    pub metrics: Metrics,
    /// Bounds total concurrent sessions (http/connect/websocket) to
    /// `config.max_connections` (§4.6). Plain `http_request` sessions never
    /// touch `registry`, so this — not `registry.len()` — is the source of
    /// truth for both admission control and the health endpoint's
    /// `active_sessions` figure.
    concurrency: Arc<Semaphore>,
}

/// Held for the lifetime of one dispatched session; dropping it frees the
/// concurrency-cap slot.
pub type SessionPermit = OwnedSemaphorePermit;

impl ServerContext {
    pub fn new(
        config: Config,
        http_client: reqwest::Client,
        dns_cache: Arc<DnsCache>,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_connections));
        Self {
            registry: Arc::new(SessionRegistry::new()),
            config,
            http_client,
            dns_cache,
            breakers: DashMap::new(),
            metrics: Metrics::default(),
            concurrency,
        }
    }

    pub fn breaker_for(&self, host: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(BreakerConfig {
                    max_failures: self.config.breaker_max_failures,
                    reset_timeout: Duration::from_secs(self.config.breaker_reset_timeout_secs),
                    half_open_timeout: Duration::from_secs(self.config.breaker_half_open_timeout_secs),
                    max_half_open_reqs: 1,
                }))
            })
            .clone()
    }

    /// Try to admit a new session under the concurrency cap. `None` means
    /// the cap is reached and the caller should reply with `TooBusy` (§4.6).
    pub fn try_admit(&self) -> Option<SessionPermit> {
        Arc::clone(&self.concurrency).try_acquire_owned().ok()
    }

    fn active_sessions(&self) -> usize {
        self.config.max_connections - self.concurrency.available_permits()
    }

    /// Snapshot returned by the health endpoint (§6.4).
    pub fn health_snapshot(&self) -> (usize, u64) {
        (self.active_sessions(), self.metrics.last_activity_epoch_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_connections: usize) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            health_addr: "127.0.0.1:0".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            region: "local".to_string(),
            service: "fluidity-tunnel".to_string(),
            expected_agent_identity: "agent.example".to_string(),
            tls_cert_path: "server.pem".to_string(),
            tls_key_path: "server-key.pem".to_string(),
            tls_ca_path: "ca.pem".to_string(),
            health_tls_cert_path: "health-cert.pem".to_string(),
            health_tls_key_path: "health-key.pem".to_string(),
            test_mode: false,
            max_connections,
            request_timeout_secs: 30,
            stream_idle_timeout_secs: 300,
            peer_auth_timeout_secs: 10,
            read_idle_timeout_secs: 60,
            stream_queue_capacity: 64,
            outbound_http_timeout_secs: 30,
            outbound_connect_timeout_secs: 10,
            allowed_ports: vec![80, 443],
            dns_cache_ttl_secs: 60,
            dns_cache_capacity: 128,
            breaker_max_failures: 5,
            breaker_reset_timeout_secs: 30,
            breaker_half_open_timeout_secs: 10,
            tcp_nodelay: true,
            log_level: "info".to_string(),
            log_json: false,
        }
    }

    fn context(max_connections: usize) -> ServerContext {
        let dns_cache = Arc::new(DnsCache::new(Duration::from_secs(60), 128));
        ServerContext::new(config(max_connections), reqwest::Client::new(), dns_cache)
    }

    #[test]
    fn try_admit_respects_the_concurrency_cap() {
        let ctx = context(2);
        let first = ctx.try_admit().expect("first session admitted");
        let second = ctx.try_admit().expect("second session admitted");
        assert!(ctx.try_admit().is_none(), "cap of 2 should reject a third session");
        drop(first);
        assert!(ctx.try_admit().is_some(), "releasing a permit frees a slot");
        drop(second);
    }

    #[test]
    fn health_snapshot_tracks_active_sessions() {
        let ctx = context(4);
        assert_eq!(ctx.health_snapshot().0, 0);
        let permit = ctx.try_admit().unwrap();
        assert_eq!(ctx.health_snapshot().0, 1);
        drop(permit);
        assert_eq!(ctx.health_snapshot().0, 0);
    }

    #[test]
    fn breaker_for_returns_the_same_instance_per_host() {
        let ctx = context(4);
        let a = ctx.breaker_for("example.com");
        let b = ctx.breaker_for("example.com");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
