//! Server dispatch engine (§4.6): translates inbound tunnel envelopes into
//! outbound HTTP/TCP/WebSocket operations.
//!
//! `route` is the reader task's single entry point, mirrored against the
//! Agent's `SessionRegistry::deliver`-or-spawn split: session-opening
//! envelopes (`http_request`, `connect_open`, `ws_open`) spawn a new
//! dispatch task subject to the concurrency cap; follow-up envelopes for an
//! already-open stream (`connect_data`/`connect_close`/`ws_message`/
//! `ws_close`) are routed through `ctx.registry.deliver`. Reply-direction
//! envelopes arriving from the Agent (`http_response`, `connect_ack`,
//! `ws_ack`) are a protocol violation on this side and are dropped with a
//! warning rather than closing the tunnel (§4.4: unknown/unexpected
//! envelopes are logged and dropped, not fatal).

pub mod connect;
pub mod http;
pub mod websocket;

use std::sync::Arc;

use fluidity_protocol::envelope::{
    ConnectAckPayload, HttpResponsePayload, WsAckPayload,
};
use fluidity_protocol::{Envelope, SessionError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::ServerContext;

pub async fn route(ctx: Arc<ServerContext>, outbound: mpsc::Sender<Envelope>, envelope: Envelope) {
    match envelope {
        Envelope::HttpRequest(payload) => {
            let Some(permit) = ctx.try_admit() else {
                let _ = outbound
                    .send(Envelope::HttpResponse(HttpResponsePayload {
                        id: payload.id,
                        status: 0,
                        headers: Default::default(),
                        body: Vec::new(),
                        error: Some("TooBusy".to_string()),
                    }))
                    .await;
                return;
            };
            tokio::spawn(async move {
                let _permit = permit;
                http::handle(ctx, outbound, payload).await;
            });
        }
        Envelope::ConnectOpen(payload) => {
            let Some(permit) = ctx.try_admit() else {
                let _ = outbound
                    .send(Envelope::ConnectAck(ConnectAckPayload {
                        id: payload.id,
                        ok: false,
                        error: Some("TooBusy".to_string()),
                    }))
                    .await;
                return;
            };
            tokio::spawn(async move {
                let _permit = permit;
                connect::handle(ctx, outbound, payload).await;
            });
        }
        Envelope::WsOpen(payload) => {
            let Some(permit) = ctx.try_admit() else {
                let _ = outbound
                    .send(Envelope::WsAck(WsAckPayload {
                        id: payload.id,
                        ok: false,
                        error: Some("TooBusy".to_string()),
                    }))
                    .await;
                return;
            };
            tokio::spawn(async move {
                let _permit = permit;
                websocket::handle(ctx, outbound, payload).await;
            });
        }
        Envelope::ConnectData(_) | Envelope::ConnectClose(_) | Envelope::WsMessage(_) | Envelope::WsClose(_) => {
            let id = envelope.id().to_string();
            if let Err(err) = ctx.registry.deliver(envelope).await {
                // §4.4: unknown session ids are expected once a session has
                // already torn down (a straggling data/close frame arriving
                // after cancellation); still logged, just at a quieter level
                // than a genuine delivery failure.
                if err == SessionError::Unknown {
                    debug!(id = %id, "dropping envelope for unknown or already-closed session");
                } else {
                    warn!(id = %id, error = %err, "failed to deliver envelope to session");
                }
            }
        }
        other => {
            warn!(type_tag = other.type_tag(), "dropping unexpected reply-direction envelope");
        }
    }
}
