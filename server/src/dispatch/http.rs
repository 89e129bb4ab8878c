//! Outbound HTTP dispatch (§4.6 "HTTP request handling").
//!
//! Grounded on `aether-proxy::tunnel::stream_handler::handle_stream_inner`'s
//! validate-then-request-then-stream-back shape, generalized from a
//! streamed multi-frame reply to fluidity's single `http_response` envelope
//! (no streaming reply type exists in the wire format) and from the
//! teacher's HMAC proxy-auth check (not applicable; peer auth already
//! happened once for the whole tunnel) to a per-request circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use fluidity_protocol::envelope::{HeaderMap as EnvelopeHeaders, HttpRequestPayload, HttpResponsePayload};
use fluidity_protocol::{Admission, Envelope};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::state::ServerContext;
use crate::target_filter::{self, FilterError};

/// Response bodies larger than this are rejected (§4.6 "`PayloadTooLarge`").
const MAX_RESPONSE_BODY: usize = 16 * 1024 * 1024;

pub async fn handle(ctx: Arc<ServerContext>, outbound: mpsc::Sender<Envelope>, payload: HttpRequestPayload) {
    let reply = dispatch(&ctx, &payload).await;
    let _ = outbound.send(Envelope::HttpResponse(reply)).await;
}

async fn dispatch(ctx: &ServerContext, payload: &HttpRequestPayload) -> HttpResponsePayload {
    let error = |code: &str| HttpResponsePayload {
        id: payload.id.clone(),
        status: 0,
        headers: Default::default(),
        body: Vec::new(),
        error: Some(code.to_string()),
    };

    let url = match Url::parse(&payload.url) {
        Ok(url) => url,
        Err(_) => return error("TargetError"),
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return error("TargetError");
    }
    let host = match url.host_str() {
        Some(host) => host.to_string(),
        None => return error("TargetError"),
    };
    let port = url
        .port_or_known_default()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });

    if let Err(err) = target_filter::validate_target(&host, port, &ctx.config.allowed_ports, &ctx.dns_cache).await {
        warn!(host = %host, error = %err, "target validation failed");
        return error(classify_filter_error(&err));
    }

    let breaker = ctx.breaker_for(&host);
    match breaker.try_acquire() {
        Admission::Rejected => return error("CircuitOpen"),
        Admission::Allowed | Admission::Probe => {}
    }

    let mut builder = ctx
        .http_client
        .request(
            payload.method.parse().unwrap_or(reqwest::Method::GET),
            url,
        )
        .timeout(Duration::from_secs(ctx.config.outbound_http_timeout_secs))
        .body(payload.body.clone());

    for (name, values) in &payload.headers {
        for value in values {
            builder = builder.header(name, value);
        }
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let mut headers = EnvelopeHeaders::new();
            for (name, value) in response.headers() {
                if let Ok(v) = value.to_str() {
                    headers.entry(name.as_str().to_string()).or_default().push(v.to_string());
                }
            }
            match response.bytes().await {
                Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY => {
                    breaker.record_failure();
                    error("PayloadTooLarge")
                }
                Ok(bytes) => {
                    breaker.record_success();
                    HttpResponsePayload {
                        id: payload.id.clone(),
                        status,
                        headers,
                        body: bytes.to_vec(),
                        error: None,
                    }
                }
                Err(err) => {
                    breaker.record_failure();
                    warn!(host = %host, error = %err, "failed reading target response body");
                    error(classify_reqwest_error(&err))
                }
            }
        }
        Err(err) => {
            breaker.record_failure();
            warn!(host = %host, error = %err, "outbound HTTP request failed");
            error(classify_reqwest_error(&err))
        }
    }
}

fn classify_filter_error(err: &FilterError) -> &'static str {
    match err {
        FilterError::DnsResolutionFailed(_) | FilterError::NoPublicAddrs(_) => "DnsFailure",
        FilterError::PrivateIp(_) | FilterError::PortNotAllowed(_) => "TargetError",
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "Timeout"
    } else if err.is_connect() {
        "ConnectionRefused"
    } else if err.is_request() || err.is_builder() {
        "TargetError"
    } else {
        "TlsError"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn dns_failures_classify_as_dns_failure() {
        assert_eq!(
            classify_filter_error(&FilterError::DnsResolutionFailed("example.com".to_string())),
            "DnsFailure"
        );
        assert_eq!(
            classify_filter_error(&FilterError::NoPublicAddrs("example.com".to_string())),
            "DnsFailure"
        );
    }

    #[test]
    fn target_errors_classify_as_target_error() {
        assert_eq!(
            classify_filter_error(&FilterError::PrivateIp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))),
            "TargetError"
        );
        assert_eq!(classify_filter_error(&FilterError::PortNotAllowed(22)), "TargetError");
    }

    #[tokio::test]
    async fn request_to_an_unroutable_address_classifies_as_connection_refused_or_timeout() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let err = client
            .get("http://127.0.0.1:1")
            .send()
            .await
            .expect_err("nothing listens on port 1");
        let code = classify_reqwest_error(&err);
        assert!(code == "ConnectionRefused" || code == "Timeout");
    }
}
