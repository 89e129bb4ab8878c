//! WebSocket upgrade (§4.5.3): complete the client handshake locally, open
//! a `WebSocketStream` session, and relay frames in both directions.
//!
//! New relative to the teacher (which never terminates a client WS
//! handshake itself); grounded on the `ws_open`/`ws_message`/`ws_close`
//! triad modeled in the `other_examples` tunnel-protocol corpus, built with
//! the handshake/framing helpers `tokio-tungstenite` already provides.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fluidity_protocol::envelope::{HeaderMap as EnvelopeHeaders, WsClosePayload, WsMessagePayload, WsOpenPayload};
use fluidity_protocol::{new_correlation_id, Admission, Envelope, SessionError, SessionKind, SessionWaiter};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

use crate::proxy::bad_gateway;
use crate::state::AgentContext;
use crate::tunnel::TunnelState;

pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub async fn handle(
    ctx: Arc<AgentContext>,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if *ctx.tunnel.state.borrow() == TunnelState::Lost {
        return bad_gateway();
    }

    match ctx.breaker.try_acquire() {
        Admission::Rejected => return bad_gateway(),
        Admission::Allowed | Admission::Probe => {}
    }

    let handshake_request = http::Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version());
    let handshake_request = req
        .headers()
        .iter()
        .fold(handshake_request, |b, (k, v)| b.header(k, v))
        .body(())
        .expect("cloned request parts always build");

    let handshake_response = match create_response(&handshake_request) {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "client did not send a valid WebSocket handshake");
            return bad_gateway();
        }
    };

    let url = req.uri().to_string();
    let mut headers = EnvelopeHeaders::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
    }

    let id = new_correlation_id();
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(ctx.config.stream_idle_timeout_secs);
    let waiter = match ctx.registry.register_with_capacity(
        id.clone(),
        SessionKind::WebSocketStream,
        deadline.into_std(),
        ctx.config.stream_queue_capacity,
    ) {
        Ok(waiter) => waiter,
        Err(_) => return bad_gateway(),
    };

    if ctx
        .tunnel
        .outbound
        .send(Envelope::WsOpen(WsOpenPayload {
            id: id.clone(),
            url,
            headers,
        }))
        .await
        .is_err()
    {
        ctx.registry.cancel(&id, SessionError::TunnelLost);
        ctx.breaker.record_failure();
        return bad_gateway();
    }

    let SessionWaiter::Stream(mut rx) = waiter else {
        unreachable!("WebSocketStream registration always returns a Stream waiter")
    };

    match rx.recv().await {
        Some(Ok(Envelope::WsAck(ack))) if ack.ok => {
            ctx.breaker.record_success();
        }
        _ => {
            ctx.registry.cancel(&id, SessionError::Cancelled);
            ctx.breaker.record_failure();
            return bad_gateway();
        }
    }

    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                pump(ctx, id, ws, rx).await;
            }
            Err(err) => warn!(error = %err, "client WebSocket upgrade failed"),
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| bad_gateway());
    *response.headers_mut() = handshake_response.headers().clone();
    response
}

async fn pump<IO>(
    ctx: Arc<AgentContext>,
    id: String,
    mut ws: WebSocketStream<IO>,
    mut rx: mpsc::Receiver<Result<Envelope, SessionError>>,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut local_closed = false;
    let mut remote_closed = false;

    while !(local_closed && remote_closed) {
        tokio::select! {
            frame = ws.next(), if !local_closed => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let sent = ctx.tunnel.outbound.send(Envelope::WsMessage(WsMessagePayload {
                            id: id.clone(),
                            binary: false,
                            data: text.into_bytes(),
                        })).await;
                        if sent.is_err() { local_closed = true; remote_closed = true; }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let sent = ctx.tunnel.outbound.send(Envelope::WsMessage(WsMessagePayload {
                            id: id.clone(),
                            binary: true,
                            data: data.to_vec(),
                        })).await;
                        if sent.is_err() { local_closed = true; remote_closed = true; }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        local_closed = true;
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), Some(f.reason.to_string())))
                            .unwrap_or((1000, None));
                        let _ = ctx.tunnel.outbound.send(Envelope::WsClose(fluidity_protocol::envelope::WsClosePayload {
                            id: id.clone(),
                            code,
                            reason,
                        })).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "client websocket error");
                        local_closed = true;
                    }
                    None => { local_closed = true; }
                }
            }
            message = rx.recv(), if !remote_closed => {
                match message {
                    Some(Ok(Envelope::WsMessage(msg))) => {
                        let frame = if msg.binary {
                            Message::Binary(msg.data.into())
                        } else {
                            Message::Text(String::from_utf8_lossy(&msg.data).into_owned().into())
                        };
                        if ws.send(frame).await.is_err() {
                            remote_closed = true;
                        }
                    }
                    Some(Ok(Envelope::WsClose(close))) => {
                        remote_closed = true;
                        let _ = ws.send(Message::Close(Some(CloseFrame {
                            code: close.code.into(),
                            reason: close.reason.unwrap_or_default().into(),
                        }))).await;
                    }
                    Some(Ok(_)) | Some(Err(_)) | None => {
                        remote_closed = true;
                    }
                }
            }
        }
    }

    let _ = ws.close(None).await;
    ctx.registry.cancel(&id, SessionError::Cancelled);
}
