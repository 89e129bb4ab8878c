pub mod connect;
pub mod http;
pub mod server;
pub mod websocket;

pub use server::run;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Hop-by-hop headers stripped in both directions (§4.5.1).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

pub fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response is always well-formed")
}

pub fn bad_gateway() -> Response<Full<Bytes>> {
    plain_response(StatusCode::BAD_GATEWAY, "fluidity: tunnel unavailable")
}

pub fn gateway_timeout() -> Response<Full<Bytes>> {
    plain_response(StatusCode::GATEWAY_TIMEOUT, "fluidity: upstream session timed out")
}

pub fn bad_request() -> Response<Full<Bytes>> {
    plain_response(StatusCode::BAD_REQUEST, "fluidity: malformed proxy request")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("upgrade"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-correlation-id"));
    }

    #[test]
    fn bad_gateway_reports_502() {
        assert_eq!(bad_gateway().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn gateway_timeout_reports_504() {
        assert_eq!(gateway_timeout().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn bad_request_reports_400() {
        assert_eq!(bad_request().status(), StatusCode::BAD_REQUEST);
    }
}
