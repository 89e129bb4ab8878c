//! Lifecycle client (§4.7): signed Wake / Query / Kill RPCs against the
//! cloud control plane.
//!
//! Grounded on `aether-proxy::registration::client::AetherClient`'s
//! `send_with_retry` (attempt counter, jittered doubling delay capped at a
//! maximum, retry on 5xx/network failure), generalized from
//! Register/Heartbeat/Unregister to Wake/Query/Kill, and signed with the
//! shared SigV4-style signer (§6.3) instead of the teacher's static bearer
//! token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fluidity_protocol::sigv4::{self, SignedHeader, SigningInput};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("wake request failed after retries: {0}")]
    WakeFailed(String),
    #[error("wake response is missing server_address or server_identity")]
    IncompleteWakeResponse,
    #[error("query polling timed out after {0:?}")]
    QueryTimeout(Duration),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WakeResponse {
    pub server_address: String,
    pub server_identity: String,
    pub agent_address_as_seen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub ready: bool,
    pub server_address: String,
    pub server_identity: String,
}

pub struct LifecycleClient {
    http: reqwest::Client,
    config: Config,
}

impl LifecycleClient {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self { http, config })
    }

    fn sign_request(&self, method: &str, url: &Url) -> (String, String) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the Unix epoch")
            .as_secs();
        let timestamp = format!("{now}");
        let host = url.host_str().unwrap_or_default().to_string();
        let headers = vec![SignedHeader {
            name: "host".to_string(),
            value: host,
        }];
        let input = SigningInput {
            timestamp: &timestamp,
            region: &self.config.region,
            service: &self.config.service,
            access_key_id: &self.config.access_key_id,
            method,
            path: url.path(),
            signed_headers: &headers,
        };
        let signature = sigv4::sign(self.config.secret_key.as_bytes(), &input);
        (timestamp, signature)
    }

    fn signed_request(&self, method: reqwest::Method, url: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let parsed = Url::parse(url)?;
        let (timestamp, signature) = self.sign_request(method.as_str(), &parsed);
        Ok(self
            .http
            .request(method, url)
            .header("x-fluidity-timestamp", timestamp)
            .header("x-fluidity-region", &self.config.region)
            .header("x-fluidity-service", &self.config.service)
            .header("x-fluidity-access-key-id", &self.config.access_key_id)
            .header("x-fluidity-signature", signature)
            .header("x-fluidity-signed-headers", "host"))
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
    }

    /// Wake the Server, retrying 5xx/network failures with exponential
    /// backoff up to `max_retries`.
    pub async fn wake(&self) -> Result<WakeResponse, LifecycleError> {
        let mut delay = Duration::from_millis(self.config.retry_base_delay_ms);
        let max_delay = Duration::from_millis(self.config.retry_max_delay_ms);
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            let request = self.signed_request(reqwest::Method::POST, &self.config.wake_url)?;
            let send_result = request.json(&serde_json::json!({})).send().await;

            let (retryable, outcome) = match send_result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        (false, response.json::<WakeResponse>().await.map_err(LifecycleError::from))
                    } else {
                        (
                            Self::should_retry_status(status),
                            Err(LifecycleError::WakeFailed(format!("status {status}"))),
                        )
                    }
                }
                Err(err) => (true, Err(LifecycleError::from(err))),
            };

            match outcome {
                Ok(response) => {
                    if response.server_address.is_empty() || response.server_identity.is_empty() {
                        return Err(LifecycleError::IncompleteWakeResponse);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    last_error = err.to_string();
                    if !retryable || attempt == self.config.max_retries {
                        break;
                    }
                    warn!(attempt, error = %last_error, "wake attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
        Err(LifecycleError::WakeFailed(last_error))
    }

    /// Poll Query until `ready=true` or `query_timeout_secs` elapses.
    pub async fn query_until_ready(&self) -> Result<QueryResponse, LifecycleError> {
        let timeout = Duration::from_secs(self.config.query_timeout_secs);
        let interval = Duration::from_secs(self.config.query_retry_interval_secs);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let request = self.signed_request(reqwest::Method::POST, &self.config.query_url)?;
            match request.json(&serde_json::json!({})).send().await {
                Ok(response) if response.status().is_success() => {
                    let body: QueryResponse = response.json().await?;
                    if body.ready {
                        return Ok(body);
                    }
                    debug!("server not yet ready");
                }
                Ok(response) => {
                    debug!(status = %response.status(), "query returned non-success status");
                }
                Err(err) => {
                    debug!(error = %err, "query request failed");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LifecycleError::QueryTimeout(timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Best-effort Kill: one attempt with a short timeout. Failures are
    /// logged, never propagated (§4.7 "Guarantees").
    pub async fn kill(&self) {
        let timeout = Duration::from_secs(self.config.kill_timeout_secs);
        let request = match self.signed_request(reqwest::Method::POST, &self.config.kill_url) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to build kill request");
                return;
            }
        };
        let attempt = request.json(&serde_json::json!({})).send();
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(response)) if response.status().is_success() => {
                debug!("kill acknowledged by control plane");
            }
            Ok(Ok(response)) => {
                warn!(status = %response.status(), "kill returned non-success status");
            }
            Ok(Err(err)) => {
                warn!(error = %err, "kill request failed");
            }
            Err(_) => {
                warn!(timeout_secs = self.config.kill_timeout_secs, "kill request timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            listen_port: 8080,
            wake_url: "https://control.example.com/wake".to_string(),
            query_url: "https://control.example.com/query".to_string(),
            kill_url: "https://control.example.com/kill".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            region: "local".to_string(),
            service: "fluidity-tunnel".to_string(),
            tls_cert_path: "agent.pem".to_string(),
            tls_key_path: "agent-key.pem".to_string(),
            tls_ca_path: "ca.pem".to_string(),
            test_mode: false,
            request_timeout_secs: 30,
            stream_idle_timeout_secs: 300,
            peer_auth_timeout_secs: 10,
            wake_timeout_secs: 180,
            query_timeout_secs: 90,
            query_retry_interval_secs: 5,
            kill_timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            stream_queue_capacity: 64,
            read_idle_timeout_secs: 60,
            tcp_nodelay: true,
            log_level: "info".to_string(),
            log_json: false,
        }
    }

    #[test]
    fn sign_request_is_stable_for_identical_inputs() {
        let client = LifecycleClient::new(config()).unwrap();
        let url = Url::parse("https://control.example.com/wake").unwrap();
        let (timestamp_a, signature_a) = client.sign_request("POST", &url);
        let (timestamp_b, signature_b) = client.sign_request("POST", &url);
        // Both calls happen within the same wall-clock second in practice,
        // but what matters is that signing is a pure function of its inputs.
        if timestamp_a == timestamp_b {
            assert_eq!(signature_a, signature_b);
        }
    }

    #[test]
    fn sign_request_verifies_against_the_shared_signer() {
        let client = LifecycleClient::new(config()).unwrap();
        let url = Url::parse("https://control.example.com/wake").unwrap();
        let (timestamp, signature) = client.sign_request("POST", &url);

        let headers = vec![SignedHeader {
            name: "host".to_string(),
            value: url.host_str().unwrap_or_default().to_string(),
        }];
        let input = SigningInput {
            timestamp: &timestamp,
            region: &client.config.region,
            service: &client.config.service,
            access_key_id: &client.config.access_key_id,
            method: "POST",
            path: url.path(),
            signed_headers: &headers,
        };
        let now: i64 = timestamp.parse().unwrap();
        assert!(sigv4::verify(client.config.secret_key.as_bytes(), &input, &signature, now, now).is_ok());
    }
}
