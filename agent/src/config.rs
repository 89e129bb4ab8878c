use clap::Parser;

/// Fluidity tunnel agent.
///
/// Exposes a local forward HTTP proxy and relays plain HTTP, CONNECT, and
/// WebSocket traffic to a dedicated Fluidity server instance over a single
/// mutually authenticated tunnel, woken on demand via the lifecycle
/// control plane.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Local port the forward proxy listens on.
    #[arg(long, env = "FLUIDITY_AGENT_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Wake RPC endpoint (absolute HTTPS URL).
    #[arg(long, env = "FLUIDITY_AGENT_WAKE_URL")]
    pub wake_url: String,

    /// Query RPC endpoint (absolute HTTPS URL).
    #[arg(long, env = "FLUIDITY_AGENT_QUERY_URL")]
    pub query_url: String,

    /// Kill RPC endpoint (absolute HTTPS URL).
    #[arg(long, env = "FLUIDITY_AGENT_KILL_URL")]
    pub kill_url: String,

    /// Access key id used in the SigV4-style signature.
    #[arg(long, env = "FLUIDITY_AGENT_ACCESS_KEY_ID")]
    pub access_key_id: String,

    /// Secret key backing the signature (never logged).
    #[arg(long, env = "FLUIDITY_AGENT_SECRET_KEY")]
    pub secret_key: String,

    /// Signing region component.
    #[arg(long, env = "FLUIDITY_AGENT_REGION", default_value = "local")]
    pub region: String,

    /// Signing service component.
    #[arg(long, env = "FLUIDITY_AGENT_SERVICE", default_value = "fluidity-tunnel")]
    pub service: String,

    /// Path to this agent's TLS certificate (PEM), presented to the server.
    #[arg(long, env = "FLUIDITY_AGENT_TLS_CERT")]
    pub tls_cert_path: String,

    /// Path to this agent's TLS private key (PEM).
    #[arg(long, env = "FLUIDITY_AGENT_TLS_KEY")]
    pub tls_key_path: String,

    /// Path to the CA bundle (PEM) used to validate the server's certificate.
    #[arg(long, env = "FLUIDITY_AGENT_TLS_CA")]
    pub tls_ca_path: String,

    /// Skip peer authentication on both sides (for integration tests only).
    #[arg(long, env = "FLUIDITY_AGENT_TEST_MODE", default_value_t = false)]
    pub test_mode: bool,

    /// Request/reply session deadline in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Stream session idle deadline in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_STREAM_IDLE_TIMEOUT", default_value_t = 300)]
    pub stream_idle_timeout_secs: u64,

    /// Peer-authentication handshake deadline in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_PEER_AUTH_TIMEOUT", default_value_t = 10)]
    pub peer_auth_timeout_secs: u64,

    /// Outer deadline for the Wake call in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_WAKE_TIMEOUT", default_value_t = 180)]
    pub wake_timeout_secs: u64,

    /// Deadline for Query polling to report ready in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_QUERY_TIMEOUT", default_value_t = 90)]
    pub query_timeout_secs: u64,

    /// Interval between Query polls in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_QUERY_RETRY_INTERVAL", default_value_t = 5)]
    pub query_retry_interval_secs: u64,

    /// Deadline for the best-effort Kill call in seconds.
    #[arg(long, env = "FLUIDITY_AGENT_KILL_TIMEOUT", default_value_t = 30)]
    pub kill_timeout_secs: u64,

    /// Maximum Wake retry attempts on 5xx/network failure.
    #[arg(long, env = "FLUIDITY_AGENT_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Initial backoff delay for Wake retries, in milliseconds.
    #[arg(long, env = "FLUIDITY_AGENT_RETRY_BASE_DELAY_MS", default_value_t = 1000)]
    pub retry_base_delay_ms: u64,

    /// Maximum backoff delay for Wake retries, in milliseconds.
    #[arg(long, env = "FLUIDITY_AGENT_RETRY_MAX_DELAY_MS", default_value_t = 10_000)]
    pub retry_max_delay_ms: u64,

    /// Bound on each stream session's inbound chunk queue.
    #[arg(long, env = "FLUIDITY_AGENT_STREAM_QUEUE_CAPACITY", default_value_t = 64)]
    pub stream_queue_capacity: usize,

    /// Tunnel read-idle timeout in seconds before the connection is declared lost.
    #[arg(long, env = "FLUIDITY_AGENT_READ_IDLE_TIMEOUT", default_value_t = 60)]
    pub read_idle_timeout_secs: u64,

    /// TCP_NODELAY on the tunnel socket.
    #[arg(long, env = "FLUIDITY_AGENT_TCP_NODELAY", default_value_t = true)]
    pub tcp_nodelay: bool,

    /// Circuit breaker: consecutive failures before the single global
    /// target-side breaker trips open (§3.4, §5).
    #[arg(long, env = "FLUIDITY_AGENT_BREAKER_MAX_FAILURES", default_value_t = 5)]
    pub breaker_max_failures: u32,

    /// Circuit breaker: seconds the breaker waits before probing again.
    #[arg(long, env = "FLUIDITY_AGENT_BREAKER_RESET_TIMEOUT", default_value_t = 30)]
    pub breaker_reset_timeout_secs: u64,

    /// Circuit breaker: seconds a half-open probe is allowed to take.
    #[arg(long, env = "FLUIDITY_AGENT_BREAKER_HALF_OPEN_TIMEOUT", default_value_t = 60)]
    pub breaker_half_open_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FLUIDITY_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[arg(long, env = "FLUIDITY_AGENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
