//! Plain HTTP forwarding (§4.5.1): translate an absolute-URI request into
//! an `http_request` envelope, register a `RequestReply` session, and
//! round-trip status/headers/body verbatim except for hop-by-hop headers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fluidity_protocol::envelope::{HeaderMap as EnvelopeHeaders, HttpRequestPayload, HttpResponsePayload};
use fluidity_protocol::{new_correlation_id, Admission, Envelope, SessionError, SessionKind, SessionWaiter};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tracing::warn;

use crate::proxy::{bad_gateway, gateway_timeout, is_hop_by_hop, plain_response};
use crate::state::AgentContext;
use crate::tunnel::TunnelState;

pub async fn handle(
    ctx: Arc<AgentContext>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if *ctx.tunnel.state.borrow() == TunnelState::Lost {
        return bad_gateway();
    }

    match ctx.breaker.try_acquire() {
        Admission::Rejected => return bad_gateway(),
        Admission::Allowed | Admission::Probe => {}
    }

    let method = req.method().to_string();
    let url = req.uri().to_string();

    let mut headers = EnvelopeHeaders::new();
    for (name, value) in req.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let value = match value.to_str() {
            Ok(v) => v.to_string(),
            Err(_) => continue,
        };
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(value);
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(err) => {
            warn!(error = %err, "failed to read client request body");
            return plain_response(StatusCode::BAD_REQUEST, "fluidity: failed to read request body");
        }
    };

    let id = new_correlation_id();
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(ctx.config.request_timeout_secs);

    let waiter = match ctx.registry.register(
        id.clone(),
        SessionKind::RequestReply,
        deadline.into_std(),
    ) {
        Ok(waiter) => waiter,
        Err(_) => return bad_gateway(),
    };

    let envelope = Envelope::HttpRequest(HttpRequestPayload {
        id: id.clone(),
        method,
        url,
        headers,
        body,
    });

    if ctx.tunnel.outbound.send(envelope).await.is_err() {
        ctx.registry.cancel(&id, SessionError::TunnelLost);
        ctx.breaker.record_failure();
        return bad_gateway();
    }

    let SessionWaiter::Reply(rx) = waiter else {
        unreachable!("RequestReply registration always returns a Reply waiter")
    };

    match rx.await {
        Ok(Ok(Envelope::HttpResponse(response))) => {
            if response.error.is_some() {
                ctx.breaker.record_failure();
            } else {
                ctx.breaker.record_success();
            }
            build_response(response)
        }
        Ok(Ok(_)) => {
            ctx.breaker.record_failure();
            bad_gateway()
        }
        Ok(Err(SessionError::Timeout)) => {
            ctx.breaker.record_failure();
            gateway_timeout()
        }
        Ok(Err(_)) => {
            ctx.breaker.record_failure();
            bad_gateway()
        }
        Err(_) => {
            ctx.breaker.record_failure();
            bad_gateway()
        }
    }
}

fn build_response(payload: HttpResponsePayload) -> Response<Full<Bytes>> {
    if let Some(error) = payload.error {
        warn!(error = %error, "target returned a classified error");
        return bad_gateway();
    }

    let mut builder = Response::builder().status(
        StatusCode::from_u16(payload.status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    for (name, values) in payload.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        for value in values {
            builder = builder.header(&name, value);
        }
    }
    builder
        .body(Full::new(Bytes::from(payload.body)))
        .unwrap_or_else(|_| bad_gateway())
}
