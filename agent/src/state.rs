use std::sync::Arc;
use std::time::Duration;

use fluidity_protocol::{BreakerConfig, CircuitBreaker, SessionRegistry};

use crate::config::Config;
use crate::tunnel::Tunnel;

/// Everything the proxy engine needs to translate client traffic into
/// tunnel envelopes: the single open tunnel (one agent, one server, for
/// this process's lifetime), the session registry, a single global circuit
/// breaker guarding all outbound calls through the tunnel (§3.4, §5 — one
/// breaker for the whole Agent, unlike the Server's per-target-host
/// breakers), and the resolved config. Shared read-only across connection
/// handlers via `Arc`.
pub struct AgentContext {
    pub tunnel: Tunnel,
    pub registry: Arc<SessionRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub config: Config,
}

impl AgentContext {
    pub fn new(tunnel: Tunnel, registry: Arc<SessionRegistry>, config: Config) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            max_failures: config.breaker_max_failures,
            reset_timeout: Duration::from_secs(config.breaker_reset_timeout_secs),
            half_open_timeout: Duration::from_secs(config.breaker_half_open_timeout_secs),
            max_half_open_reqs: 1,
        }));
        Self { tunnel, registry, breaker, config }
    }
}
