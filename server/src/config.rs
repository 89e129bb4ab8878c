use clap::Parser;

/// Fluidity tunnel server.
///
/// Accepts a single mutually authenticated tunnel from one Agent and
/// dispatches its envelopes as outbound HTTP, TCP, and WebSocket operations
/// against arbitrary targets.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address the mTLS tunnel listener binds to.
    #[arg(long, env = "FLUIDITY_SERVER_BIND_ADDR", default_value = "0.0.0.0:8443")]
    pub bind_addr: String,

    /// Address the plaintext health listener binds to.
    #[arg(long, env = "FLUIDITY_SERVER_HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: String,

    /// Access key id this server accepts during peer authentication.
    #[arg(long, env = "FLUIDITY_SERVER_ACCESS_KEY_ID")]
    pub access_key_id: String,

    /// Secret key backing peer-authentication signature verification.
    #[arg(long, env = "FLUIDITY_SERVER_SECRET_KEY")]
    pub secret_key: String,

    /// Signing region component expected during peer authentication.
    #[arg(long, env = "FLUIDITY_SERVER_REGION", default_value = "local")]
    pub region: String,

    /// Signing service component expected during peer authentication.
    #[arg(long, env = "FLUIDITY_SERVER_SERVICE", default_value = "fluidity-tunnel")]
    pub service: String,

    /// Canonical identity string the agent's certificate must present
    /// (subject CN or a SAN entry), discovered out-of-band from whatever
    /// assigned this server to that agent.
    #[arg(long, env = "FLUIDITY_SERVER_EXPECTED_AGENT_IDENTITY")]
    pub expected_agent_identity: String,

    /// Path to this server's TLS certificate (PEM), presented to the agent.
    #[arg(long, env = "FLUIDITY_SERVER_TLS_CERT")]
    pub tls_cert_path: String,

    /// Path to this server's TLS private key (PEM).
    #[arg(long, env = "FLUIDITY_SERVER_TLS_KEY")]
    pub tls_key_path: String,

    /// Path to the CA bundle (PEM) used to validate the agent's certificate.
    #[arg(long, env = "FLUIDITY_SERVER_TLS_CA")]
    pub tls_ca_path: String,

    /// Path to the health listener's TLS certificate; generated as a
    /// self-signed certificate on first run if absent (§6.4 is plain HTTP in
    /// production, but local/dev runs may still want a quick cert around).
    #[arg(long, env = "FLUIDITY_SERVER_HEALTH_TLS_CERT", default_value = "health-cert.pem")]
    pub health_tls_cert_path: String,

    /// Path to the health listener's TLS private key.
    #[arg(long, env = "FLUIDITY_SERVER_HEALTH_TLS_KEY", default_value = "health-key.pem")]
    pub health_tls_key_path: String,

    /// Skip peer authentication on both sides (for integration tests only).
    #[arg(long, env = "FLUIDITY_SERVER_TEST_MODE", default_value_t = false)]
    pub test_mode: bool,

    /// Maximum number of concurrent sessions before new ones are rejected
    /// with an explicit `TooBusy` error envelope.
    #[arg(long, env = "FLUIDITY_SERVER_MAX_CONNECTIONS", default_value_t = 100)]
    pub max_connections: usize,

    /// Request/reply session deadline in seconds.
    #[arg(long, env = "FLUIDITY_SERVER_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Stream session idle deadline in seconds.
    #[arg(long, env = "FLUIDITY_SERVER_STREAM_IDLE_TIMEOUT", default_value_t = 300)]
    pub stream_idle_timeout_secs: u64,

    /// Peer-authentication handshake deadline in seconds.
    #[arg(long, env = "FLUIDITY_SERVER_PEER_AUTH_TIMEOUT", default_value_t = 10)]
    pub peer_auth_timeout_secs: u64,

    /// Tunnel read-idle timeout in seconds before the connection is declared lost.
    #[arg(long, env = "FLUIDITY_SERVER_READ_IDLE_TIMEOUT", default_value_t = 60)]
    pub read_idle_timeout_secs: u64,

    /// Bound on each stream session's inbound chunk queue.
    #[arg(long, env = "FLUIDITY_SERVER_STREAM_QUEUE_CAPACITY", default_value_t = 64)]
    pub stream_queue_capacity: usize,

    /// Outbound HTTP request deadline in seconds.
    #[arg(long, env = "FLUIDITY_SERVER_OUTBOUND_HTTP_TIMEOUT", default_value_t = 30)]
    pub outbound_http_timeout_secs: u64,

    /// Outbound TCP connect deadline in seconds.
    #[arg(long, env = "FLUIDITY_SERVER_OUTBOUND_CONNECT_TIMEOUT", default_value_t = 10)]
    pub outbound_connect_timeout_secs: u64,

    /// Ports the dispatch engine is allowed to connect out to.
    #[arg(
        long,
        env = "FLUIDITY_SERVER_ALLOWED_PORTS",
        value_delimiter = ',',
        default_value = "80,443,8080,8443"
    )]
    pub allowed_ports: Vec<u16>,

    /// DNS cache TTL in seconds.
    #[arg(long, env = "FLUIDITY_SERVER_DNS_CACHE_TTL", default_value_t = 60)]
    pub dns_cache_ttl_secs: u64,

    /// DNS cache maximum entry count.
    #[arg(long, env = "FLUIDITY_SERVER_DNS_CACHE_CAPACITY", default_value_t = 1024)]
    pub dns_cache_capacity: usize,

    /// Circuit breaker: consecutive failures before a target host trips open.
    #[arg(long, env = "FLUIDITY_SERVER_BREAKER_MAX_FAILURES", default_value_t = 5)]
    pub breaker_max_failures: u32,

    /// Circuit breaker: seconds an open breaker waits before probing again.
    #[arg(long, env = "FLUIDITY_SERVER_BREAKER_RESET_TIMEOUT", default_value_t = 30)]
    pub breaker_reset_timeout_secs: u64,

    /// Circuit breaker: seconds a half-open probe is allowed to take.
    #[arg(long, env = "FLUIDITY_SERVER_BREAKER_HALF_OPEN_TIMEOUT", default_value_t = 60)]
    pub breaker_half_open_timeout_secs: u64,

    /// TCP_NODELAY on the tunnel socket.
    #[arg(long, env = "FLUIDITY_SERVER_TCP_NODELAY", default_value_t = true)]
    pub tcp_nodelay: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FLUIDITY_SERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON.
    #[arg(long, env = "FLUIDITY_SERVER_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}
