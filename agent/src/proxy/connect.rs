//! HTTP CONNECT tunneling (§4.5.2): open a `ConnectStream` session and copy
//! bytes bidirectionally as `connect_data` envelopes once the target
//! connect succeeds.
//!
//! Grounded on `aether-proxy::proxy::connect::handle_connect`'s
//! upgrade-then-copy shape, generalized from "copy straight to a local TCP
//! socket" to "read/write `connect_data` envelopes through the tunnel".

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fluidity_protocol::envelope::{ConnectClosePayload, ConnectDataPayload, ConnectOpenPayload};
use fluidity_protocol::{new_correlation_id, Admission, Envelope, SessionError, SessionKind, SessionWaiter};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::proxy::{bad_gateway, bad_request, plain_response};
use crate::state::AgentContext;
use crate::tunnel::TunnelState;

/// Bytes read from the client per `connect_data` frame.
const CHUNK_SIZE: usize = 16 * 1024;

pub async fn handle(
    ctx: Arc<AgentContext>,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let host = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => return bad_request(),
    };

    if *ctx.tunnel.state.borrow() == TunnelState::Lost {
        return bad_gateway();
    }

    match ctx.breaker.try_acquire() {
        Admission::Rejected => return bad_gateway(),
        Admission::Allowed | Admission::Probe => {}
    }

    let id = new_correlation_id();
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(ctx.config.stream_idle_timeout_secs);
    let waiter = match ctx.registry.register_with_capacity(
        id.clone(),
        SessionKind::ConnectStream,
        deadline.into_std(),
        ctx.config.stream_queue_capacity,
    ) {
        Ok(waiter) => waiter,
        Err(_) => return bad_gateway(),
    };

    if ctx
        .tunnel
        .outbound
        .send(Envelope::ConnectOpen(ConnectOpenPayload {
            id: id.clone(),
            host,
        }))
        .await
        .is_err()
    {
        ctx.registry.cancel(&id, SessionError::TunnelLost);
        ctx.breaker.record_failure();
        return bad_gateway();
    }

    let SessionWaiter::Stream(mut rx) = waiter else {
        unreachable!("ConnectStream registration always returns a Stream waiter")
    };

    match rx.recv().await {
        Some(Ok(Envelope::ConnectAck(ack))) if ack.ok => {
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
                pump(ctx, id, io, rx).await;
            }
            Err(err) => warn!(error = %err, "client CONNECT upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| bad_gateway())
}

async fn pump<IO>(
    ctx: Arc<AgentContext>,
    id: String,
    io: IO,
    mut rx: mpsc::Receiver<Result<Envelope, SessionError>>,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(io);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut local_closed = false;
    let mut remote_closed = false;

    while !(local_closed && remote_closed) {
        tokio::select! {
            result = read_half.read(&mut buf), if !local_closed => {
                match result {
                    Ok(0) | Err(_) => {
                        local_closed = true;
                        let _ = ctx.tunnel.outbound.send(Envelope::ConnectClose(ConnectClosePayload {
                            id: id.clone(),
                            reason: None,
                        })).await;
                    }
                    Ok(n) => {
                        let sent = ctx.tunnel.outbound.send(Envelope::ConnectData(ConnectDataPayload {
                            id: id.clone(),
                            data: buf[..n].to_vec(),
                        })).await;
                        if sent.is_err() {
                            local_closed = true;
                            remote_closed = true;
                        }
                    }
                }
            }
            message = rx.recv(), if !remote_closed => {
                match message {
                    Some(Ok(Envelope::ConnectData(data))) => {
                        if write_half.write_all(&data.data).await.is_err() {
                            remote_closed = true;
                        }
                    }
                    Some(Ok(Envelope::ConnectClose(_))) | None | Some(Err(_)) => {
                        remote_closed = true;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    ctx.registry.cancel(&id, SessionError::Cancelled);
}
