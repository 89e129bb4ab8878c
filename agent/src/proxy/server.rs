//! Local forward proxy listener (§6.1): plain TCP, no TLS, no
//! authentication. Grounded on `aether-proxy::proxy::server::run`'s accept
//! loop and per-connection `service_fn`, generalized to also forward
//! absolute-URI plain requests (the teacher only ever handled CONNECT and
//! its own delegate endpoint).

use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::proxy::{connect, http, websocket};
use crate::state::AgentContext;

pub async fn run(ctx: Arc<AgentContext>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "local proxy listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("proxy listener shutting down, no longer accepting connections");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let ctx = ctx.clone();
                        async move { Ok::<_, Infallible>(dispatch(ctx, req).await) }
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        warn!(error = %err, %peer, "proxy connection error");
                    }
                });
            }
        }
    }
}

async fn dispatch(
    ctx: Arc<AgentContext>,
    req: Request<hyper::body::Incoming>,
) -> hyper::Response<http_body_util::Full<bytes::Bytes>> {
    if req.method() == Method::CONNECT {
        return connect::handle(ctx, req).await;
    }
    if websocket::is_websocket_upgrade(&req) {
        return websocket::handle(ctx, req).await;
    }
    http::handle(ctx, req).await
}
