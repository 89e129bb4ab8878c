//! Outbound TCP CONNECT dispatch (§4.6 "CONNECT handling").
//!
//! Grounded on `aether-proxy::proxy::connect::handle_connect`'s
//! connect-then-bidirectional-copy shape, generalized from
//! `tokio::io::copy_bidirectional` over a local socket to chunked
//! `connect_data` envelopes (≤ 32 KiB per frame per §4.6) relayed through
//! the session registry, with independent half-close tracking per side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fluidity_protocol::envelope::{ConnectAckPayload, ConnectClosePayload, ConnectDataPayload, ConnectOpenPayload};
use fluidity_protocol::{Envelope, SessionError, SessionKind, SessionWaiter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use crate::state::ServerContext;
use crate::target_filter;

/// Upper bound on each outbound `connect_data` frame (§4.6).
const MAX_CHUNK_SIZE: usize = 32 * 1024;

pub async fn handle(ctx: Arc<ServerContext>, outbound: mpsc::Sender<Envelope>, payload: ConnectOpenPayload) {
    let id = payload.id.clone();

    let (host, port) = match split_host_port(&payload.host) {
        Some(hp) => hp,
        None => {
            let _ = outbound
                .send(ack(&id, false, Some("TargetError")))
                .await;
            return;
        }
    };

    let addrs = match target_filter::validate_target(&host, port, &ctx.config.allowed_ports, &ctx.dns_cache).await {
        Ok(addrs) => addrs,
        Err(err) => {
            warn!(host = %host, error = %err, "CONNECT target validation failed");
            let _ = outbound.send(ack(&id, false, Some("TargetError"))).await;
            return;
        }
    };

    let connect_timeout = Duration::from_secs(ctx.config.outbound_connect_timeout_secs);
    let stream = match connect_any(&addrs, connect_timeout).await {
        Some(stream) => stream,
        None => {
            let _ = outbound.send(ack(&id, false, Some("ConnectionRefused"))).await;
            return;
        }
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(ctx.config.stream_idle_timeout_secs);
    let waiter = match ctx.registry.register_with_capacity(
        id.clone(),
        SessionKind::ConnectStream,
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
        unreachable!("ConnectStream registration always returns a Stream waiter")
    };

    if outbound.send(ack(&id, true, None)).await.is_err() {
        ctx.registry.cancel(&id, SessionError::TunnelLost);
        return;
    }

    pump(ctx, id, stream, outbound, rx).await;
}

fn ack(id: &str, ok: bool, error: Option<&str>) -> Envelope {
    Envelope::ConnectAck(ConnectAckPayload {
        id: id.to_string(),
        ok,
        error: error.map(str::to_string),
    })
}

fn split_host_port(host_port: &str) -> Option<(String, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

async fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Option<TcpStream> {
    for addr in addrs {
        if let Ok(Ok(stream)) = tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            return Some(stream);
        }
    }
    None
}

async fn pump(
    ctx: Arc<ServerContext>,
    id: String,
    stream: TcpStream,
    outbound: mpsc::Sender<Envelope>,
    mut rx: mpsc::Receiver<Result<Envelope, SessionError>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut local_closed = false;
    let mut remote_closed = false;

    while !(local_closed && remote_closed) {
        tokio::select! {
            result = read_half.read(&mut buf), if !local_closed => {
                match result {
                    Ok(0) | Err(_) => {
                        local_closed = true;
                        let _ = outbound.send(Envelope::ConnectClose(ConnectClosePayload {
                            id: id.clone(),
                            reason: None,
                        })).await;
                    }
                    Ok(n) => {
                        let sent = outbound.send(Envelope::ConnectData(ConnectDataPayload {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_parses_hostname_and_port() {
        assert_eq!(
            split_host_port("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn split_host_port_parses_ipv6_literal() {
        assert_eq!(
            split_host_port("[::1]:8080"),
            Some(("[::1]".to_string(), 8080))
        );
    }

    #[test]
    fn split_host_port_rejects_missing_port() {
        assert_eq!(split_host_port("example.com"), None);
    }

    #[test]
    fn split_host_port_rejects_non_numeric_port() {
        assert_eq!(split_host_port("example.com:https"), None);
    }
}
