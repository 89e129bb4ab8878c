//! Client-side tunnel transport (§4.4): one mTLS connection, a dedicated
//! reader task and a dedicated writer task, structured so that when either
//! exits the other is cancelled and the tunnel is declared `Lost`.
//!
//! Grounded on `aether-proxy::tunnel::writer::spawn_writer`'s single
//! bounded-channel writer task, generalized from WebSocket `Message` frames
//! to newline-delimited `Envelope` JSON lines, and on
//! `aether-proxy::tunnel::dispatcher::run`'s per-frame dispatch loop,
//! generalized from a binary `MsgType` match to `registry.deliver`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fluidity_protocol::envelope::{
    read_envelope, write_envelope, IamAuthRequestPayload, IamAuthResponsePayload,
};
use fluidity_protocol::sigv4::{sign, SignedHeader, SigningInput, TUNNEL_AUTH_METHOD, TUNNEL_AUTH_PATH};
use fluidity_protocol::{
    new_correlation_id, verify_peer_identity, Envelope, SessionError, SessionRegistry,
};
use rustls_pki_types::ServerName;
use tokio::io::{split, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connected,
    Lost,
}

/// A live tunnel connection: the outbound envelope queue and a watch
/// channel that flips to `Lost` the moment either I/O task exits.
pub struct Tunnel {
    pub outbound: mpsc::Sender<Envelope>,
    pub state: watch::Receiver<TunnelState>,
    reader_abort: AbortHandle,
    writer_abort: AbortHandle,
}

impl Tunnel {
    /// Deliberate teardown: abort both I/O tasks. Callers should cancel the
    /// session registry with `Shutdown` first (§4.8 step 2) so the
    /// supervisor's subsequent `TunnelLost` sweep is a no-op.
    pub fn shutdown(&self) {
        self.reader_abort.abort();
        self.writer_abort.abort();
    }
}

pub struct OpenParams<'a> {
    pub server_addr: SocketAddr,
    pub server_name: ServerName<'static>,
    pub expected_identity: &'a str,
    pub tcp_nodelay: bool,
    pub read_idle_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub registry: Arc<SessionRegistry>,
    /// Skips the `iam_auth_request`/`iam_auth_response` exchange entirely
    /// (§4.6: "If the Agent is in 'test mode' ... peer authentication is
    /// skipped on both sides").
    pub test_mode: bool,
    pub access_key_id: &'a str,
    pub secret_key: &'a [u8],
    pub region: &'a str,
    pub service: &'a str,
    pub peer_auth_timeout: Duration,
}

/// Connect, complete the mTLS handshake, verify the peer's certificate
/// identity, perform the `iam_auth_request`/`iam_auth_response` handshake
/// (§4.6) on the raw split streams, and only then spawn the
/// reader/writer/supervisor tasks that hand envelopes to the session
/// registry.
pub async fn open(connector: &TlsConnector, params: OpenParams<'_>) -> anyhow::Result<Tunnel> {
    let tcp = TcpStream::connect(params.server_addr)
        .await
        .with_context(|| format!("connecting to server at {}", params.server_addr))?;
    tcp.set_nodelay(params.tcp_nodelay)?;

    let tls_stream = connector
        .connect(params.server_name, tcp)
        .await
        .context("TLS handshake with server failed")?;

    let peer_der = {
        let (_, server_conn) = tls_stream.get_ref();
        let certs = server_conn
            .peer_certificates()
            .ok_or_else(|| anyhow::anyhow!("server presented no certificate"))?;
        certs
            .first()
            .ok_or_else(|| anyhow::anyhow!("server certificate chain is empty"))?
            .as_ref()
            .to_vec()
    };
    verify_peer_identity(&peer_der, params.expected_identity)
        .context("server certificate identity does not match the identity discovered via Wake")?;

    let (read_half, write_half) = split(tls_stream);
    let mut reader_io = BufReader::new(read_half);
    let mut writer_io = write_half;

    if !params.test_mode {
        perform_peer_auth(
            &mut reader_io,
            &mut writer_io,
            params.access_key_id,
            params.secret_key,
            params.region,
            params.service,
            params.peer_auth_timeout,
        )
        .await
        .context("peer authentication with server failed")?;
    } else {
        debug!("test mode: skipping iam_auth handshake");
    }

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Envelope>(params.outbound_queue_capacity);
    let (state_tx, state_rx) = watch::channel(TunnelState::Connected);
    let registry = params.registry;

    let writer_state_tx = state_tx.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if let Err(err) = write_envelope(&mut writer_io, &envelope).await {
                warn!(error = %err, "tunnel write failed");
                let _ = writer_state_tx.send(TunnelState::Lost);
                return;
            }
        }
    });

    let reader_registry = registry.clone();
    let read_idle_timeout = params.read_idle_timeout;
    let reader = tokio::spawn(async move {
        loop {
            let outcome =
                tokio::time::timeout(read_idle_timeout, read_envelope(&mut reader_io)).await;
            let envelope = match outcome {
                Ok(Ok(Some(envelope))) => envelope,
                Ok(Ok(None)) => {
                    info!("tunnel closed cleanly by peer");
                    break;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "tunnel framing error; closing tunnel");
                    break;
                }
                Err(_) => {
                    warn!(
                        timeout_secs = read_idle_timeout.as_secs(),
                        "tunnel read-idle timeout elapsed; declaring tunnel lost"
                    );
                    break;
                }
            };
            if envelope.is_iam_auth() {
                debug!("ignoring unexpected iam_auth envelope after handshake completed");
                continue;
            }
            if let Err(err) = reader_registry.deliver(envelope).await {
                debug!(error = %err, "dropping envelope for unknown or completed session");
            }
        }
    });

    let reader_abort = reader.abort_handle();
    let writer_abort = writer.abort_handle();

    let supervisor_registry = registry;
    let supervisor_state_tx = state_tx;
    tokio::spawn(async move {
        tokio::select! {
            _ = reader => {},
            _ = writer => {},
        }
        let _ = supervisor_state_tx.send(TunnelState::Lost);
        supervisor_registry.cancel_all(SessionError::TunnelLost);
    });

    Ok(Tunnel {
        outbound: outbound_tx,
        state: state_rx,
        reader_abort,
        writer_abort,
    })
}

/// Send a signed `iam_auth_request` and wait for the matching
/// `iam_auth_response`, synchronously, before any generic reader/writer
/// tasks exist. Any envelope other than the matching response is treated as
/// a protocol violation at this stage: nothing else is expected this early
/// in §4.8's startup sequence.
async fn perform_peer_auth<R, W>(
    reader: &mut R,
    writer: &mut W,
    access_key_id: &str,
    secret_key: &[u8],
    region: &str,
    service: &str,
    peer_auth_timeout: Duration,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let id = new_correlation_id();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let timestamp_str = timestamp.to_string();
    let signed_headers = [SignedHeader {
        name: "x-correlation-id".to_string(),
        value: id.clone(),
    }];
    let signing_input = SigningInput {
        timestamp: &timestamp_str,
        region,
        service,
        access_key_id,
        method: TUNNEL_AUTH_METHOD,
        path: TUNNEL_AUTH_PATH,
        signed_headers: &signed_headers,
    };
    let signature = sign(secret_key, &signing_input);

    let request = Envelope::IamAuthRequest(IamAuthRequestPayload {
        id: id.clone(),
        timestamp,
        region: region.to_string(),
        service: service.to_string(),
        access_key_id: access_key_id.to_string(),
        signature,
        signed_headers: signed_headers.iter().map(|h| h.name.clone()).collect(),
    });
    write_envelope(writer, &request)
        .await
        .context("writing iam_auth_request")?;

    let response = tokio::time::timeout(peer_auth_timeout, read_envelope(reader))
        .await
        .context("timed out waiting for iam_auth_response")?
        .context("reading iam_auth_response")?
        .ok_or_else(|| anyhow::anyhow!("tunnel closed before iam_auth_response arrived"))?;

    match response {
        Envelope::IamAuthResponse(IamAuthResponsePayload { id: resp_id, ok, error }) => {
            if resp_id != id {
                anyhow::bail!("iam_auth_response correlation id mismatch");
            }
            if !ok {
                anyhow::bail!(
                    "server rejected peer authentication: {}",
                    error.unwrap_or_else(|| "no reason given".to_string())
                );
            }
            info!("peer authentication succeeded");
            Ok(())
        }
        other => anyhow::bail!(
            "expected iam_auth_response during handshake, got {}",
            other.type_tag()
        ),
    }
}
