//! Plain HTTP health listener (§6.4): `GET /health` returning
//! `{active_sessions, last_activity_epoch_seconds}`, separate from the
//! tunnel's TLS port. Grounded on `aether-proxy::proxy::server::run`'s
//! accept-loop shape, reduced to a single-route `hyper` service since the
//! health endpoint has no upgrade/dual-stack concerns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::ServerContext;

const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct HealthBody {
    active_sessions: usize,
    last_activity_epoch_seconds: u64,
}

pub async fn run(ctx: Arc<ServerContext>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr: SocketAddr = ctx
        .config
        .health_addr
        .parse()
        .with_context(|| format!("invalid health address {}", ctx.config.health_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health listener on {addr}"))?;
    info!(%addr, "health listener bound");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(error = %err, "failed to accept health connection");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = timeout(READ_WRITE_TIMEOUT * 2, serve_connection(stream, ctx)).await {
                        debug!(peer = %peer_addr, error = %err, "health connection timed out");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                info!("health listener shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection(stream: tokio::net::TcpStream, ctx: Arc<ServerContext>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { Ok::<_, hyper::Error>(handle(&ctx, &req)) }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        if !err.to_string().contains("connection closed") {
            debug!(error = %err, "health connection error");
        }
    }
}

fn handle(ctx: &ServerContext, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if req.uri().path() != "/health" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .expect("static response is always well-formed");
    }

    let (active_sessions, last_activity_epoch_seconds) = ctx.health_snapshot();
    let body = serde_json::to_vec(&HealthBody {
        active_sessions,
        last_activity_epoch_seconds,
    })
    .expect("HealthBody always serializes");

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response is always well-formed")
}
