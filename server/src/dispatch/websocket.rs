//! Outbound WebSocket dispatch (§4.6 "WebSocket handling").
//!
//! New relative to the teacher (which never dials an outbound WebSocket);
//! grounded on the `ws_open`/`ws_message`/`ws_close` triad the Agent's
//! `proxy::websocket` module already relays on the client-facing half, built
//! with `tokio-tungstenite`'s client connector instead of its server-side
//! handshake acceptor.

use std::sync::Arc;
use std::time::Duration;

use fluidity_protocol::envelope::{WsAckPayload, WsClosePayload, WsMessagePayload, WsOpenPayload};
use fluidity_protocol::{Envelope, SessionError, SessionKind, SessionWaiter};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;
use url::Url;

use crate::state::ServerContext;
use crate::target_filter;

pub async fn handle(ctx: Arc<ServerContext>, outbound: mpsc::Sender<Envelope>, payload: WsOpenPayload) {
    let id = payload.id.clone();

    let url = match Url::parse(&payload.url) {
        Ok(url) => url,
        Err(_) => {
            let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
            return;
        }
    };
    let Some(host) = url.host_str().map(str::to_string) else {
        let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
        return;
    };
    let secure = url.scheme() == "wss" || url.scheme() == "https";
    let port = url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });

    if let Err(err) = target_filter::validate_target(&host, port, &ctx.config.allowed_ports, &ctx.dns_cache).await {
        warn!(host = %host, error = %err, "WebSocket target validation failed");
        let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
        return;
    }

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(_) => {
            let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
            return;
        }
    };
    for (name, values) in &payload.headers {
        if let (Ok(header_name), Some(value)) = (
            name.parse::<http::header::HeaderName>(),
            values.first().and_then(|v| http::HeaderValue::from_str(v).ok()),
        ) {
            request.headers_mut().insert(header_name, value);
        }
    }

    let connect_timeout = Duration::from_secs(ctx.config.outbound_connect_timeout_secs);
    let ws = match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(err)) => {
            warn!(host = %host, error = %err, "outbound WebSocket handshake failed");
            let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
            return;
        }
        Err(_) => {
            let _ = outbound.send(ack(&id, false, Some("Timeout"))).await;
            return;
        }
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(ctx.config.stream_idle_timeout_secs);
    let waiter = match ctx.registry.register_with_capacity(
        id.clone(),
        SessionKind::WebSocketStream,
        deadline.into_std(),
        ctx.config.stream_queue_capacity,
    ) {
        Ok(waiter) => waiter,
        Err(_) => {
            let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
            return;
        }
    };
    let SessionWaiter::Stream(rx) = waiter else {
        unreachable!("WebSocketStream registration always returns a Stream waiter")
    };

    if outbound.send(ack(&id, true, None)).await.is_err() {
        ctx.registry.cancel(&id, SessionError::TunnelLost);
        return;
    }

    pump(ctx, id, ws, outbound, rx).await;
}

fn ack(id: &str, ok: bool, error: Option<&str>) -> Envelope {
    Envelope::WsAck(WsAckPayload {
        id: id.to_string(),
        ok,
        error: error.map(str::to_string),
    })
}

async fn pump<S>(
    ctx: Arc<ServerContext>,
    id: String,
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    outbound: mpsc::Sender<Envelope>,
    mut rx: mpsc::Receiver<Result<Envelope, SessionError>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut local_closed = false;
    let mut remote_closed = false;

    while !(local_closed && remote_closed) {
        tokio::select! {
            frame = ws.next(), if !local_closed => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let sent = outbound.send(Envelope::WsMessage(WsMessagePayload {
                            id: id.clone(),
                            binary: false,
                            data: text.into_bytes(),
                        })).await;
                        if sent.is_err() { local_closed = true; remote_closed = true; }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let sent = outbound.send(Envelope::WsMessage(WsMessagePayload {
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
                        let _ = outbound.send(Envelope::WsClose(WsClosePayload {
                            id: id.clone(),
                            code,
                            reason,
                        })).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "outbound WebSocket error");
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
