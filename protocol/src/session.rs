//! Correlation-ID session registry (§4.2).
//!
//! A single map behind a mutex, generalized from
//! `aether-proxy::tunnel::dispatcher`'s `HashMap<u32, mpsc::Sender<Frame>>`
//! (per-stream body channel) to the spec's three session kinds and string
//! correlation IDs. Sessions never hold a back-pointer into the registry
//! (Design Note "Session registry"): callers get a `SessionWaiter` that owns
//! only a receiver, and all bookkeeping lives here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::envelope::Envelope;

/// Default bound on a stream session's inbound chunk queue (§4.5 backpressure).
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    RequestReply,
    ConnectStream,
    WebSocketStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session id already registered")]
    Duplicate,
    #[error("session id not registered or already completed")]
    Unknown,
    #[error("session cancelled")]
    Cancelled,
    #[error("session deadline exceeded")]
    Timeout,
    #[error("tunnel connection lost")]
    TunnelLost,
    #[error("administrative shutdown")]
    Shutdown,
}

type ReplyResult = Result<Envelope, SessionError>;

enum Slot {
    Reply(oneshot::Sender<ReplyResult>),
    Stream(mpsc::Sender<ReplyResult>),
}

struct Entry {
    kind: SessionKind,
    slot: Slot,
    deadline: Instant,
}

/// What a caller gets back from `register`: the receiving half of the
/// session's single reply slot or inbound-chunk queue.
pub enum SessionWaiter {
    Reply(oneshot::Receiver<ReplyResult>),
    Stream(mpsc::Receiver<ReplyResult>),
}

/// Maps correlation ID -> pending-reply slot or inbound-chunk queue.
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Entry>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new session. Fails with `Duplicate` if `id` is already
    /// in-flight (§4.2).
    pub fn register(
        &self,
        id: impl Into<String>,
        kind: SessionKind,
        deadline: Instant,
    ) -> Result<SessionWaiter, SessionError> {
        self.register_with_capacity(id, kind, deadline, DEFAULT_STREAM_QUEUE_CAPACITY)
    }

    pub fn register_with_capacity(
        &self,
        id: impl Into<String>,
        kind: SessionKind,
        deadline: Instant,
        stream_queue_capacity: usize,
    ) -> Result<SessionWaiter, SessionError> {
        let id = id.into();
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&id) {
            return Err(SessionError::Duplicate);
        }
        match kind {
            SessionKind::RequestReply => {
                let (tx, rx) = oneshot::channel();
                map.insert(
                    id,
                    Entry {
                        kind,
                        slot: Slot::Reply(tx),
                        deadline,
                    },
                );
                Ok(SessionWaiter::Reply(rx))
            }
            SessionKind::ConnectStream | SessionKind::WebSocketStream => {
                let (tx, rx) = mpsc::channel(stream_queue_capacity.max(1));
                map.insert(
                    id,
                    Entry {
                        kind,
                        slot: Slot::Stream(tx),
                        deadline,
                    },
                );
                Ok(SessionWaiter::Stream(rx))
            }
        }
    }

    /// Route an inbound envelope to its registered session.
    ///
    /// Fails with `Unknown` if the id is unregistered or already completed;
    /// per §4.4 this should be logged and dropped, not treated as fatal.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), SessionError> {
        let id = envelope.id().to_string();
        let terminal = matches!(
            envelope,
            Envelope::ConnectClose(_) | Envelope::WsClose(_)
        );

        enum Resolved {
            Replied,
            Stream(mpsc::Sender<ReplyResult>),
        }

        let resolved = {
            let mut map = self.inner.lock().unwrap();
            match map.get(&id).map(|e| e.kind) {
                None => return Err(SessionError::Unknown),
                Some(SessionKind::RequestReply) => {
                    let entry = map.remove(&id).expect("checked above");
                    match entry.slot {
                        Slot::Reply(tx) => {
                            let _ = tx.send(Ok(envelope));
                            Resolved::Replied
                        }
                        Slot::Stream(_) => unreachable!("kind/slot mismatch"),
                    }
                }
                Some(SessionKind::ConnectStream) | Some(SessionKind::WebSocketStream) => {
                    let entry = map.get(&id).expect("checked above");
                    match &entry.slot {
                        Slot::Stream(tx) => Resolved::Stream(tx.clone()),
                        Slot::Reply(_) => unreachable!("kind/slot mismatch"),
                    }
                }
            }
        };

        if terminal {
            self.inner.lock().unwrap().remove(&id);
        }

        match resolved {
            Resolved::Replied => Ok(()),
            Resolved::Stream(tx) => tx.send(Ok(envelope)).await.map_err(|_| SessionError::Unknown),
        }
    }

    /// Terminate a session immediately, waking any waiter with `reason`.
    pub fn cancel(&self, id: &str, reason: SessionError) {
        let entry = self.inner.lock().unwrap().remove(id);
        if let Some(entry) = entry {
            match entry.slot {
                Slot::Reply(tx) => {
                    let _ = tx.send(Err(reason));
                }
                Slot::Stream(tx) => {
                    let _ = tx.try_send(Err(reason));
                }
            }
        }
    }

    /// Cancel every outstanding session (e.g. on tunnel loss or shutdown).
    pub fn cancel_all(&self, reason: SessionError) {
        let entries: Vec<(String, Entry)> = {
            let mut map = self.inner.lock().unwrap();
            map.drain().collect()
        };
        for (_, entry) in entries {
            match entry.slot {
                Slot::Reply(tx) => {
                    let _ = tx.send(Err(reason));
                }
                Slot::Stream(tx) => {
                    let _ = tx.try_send(Err(reason));
                }
            }
        }
    }

    /// Deadline-based sweep: cancel expired sessions with `Timeout`.
    pub fn expire_due(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let map = self.inner.lock().unwrap();
            map.iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in expired {
            self.cancel(&id, SessionError::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{HttpResponsePayload, ConnectDataPayload};
    use std::time::Duration;

    #[tokio::test]
    async fn request_reply_round_trip() {
        let registry = SessionRegistry::new();
        let waiter = registry
            .register("id-1", SessionKind::RequestReply, Instant::now() + Duration::from_secs(30))
            .unwrap();

        registry
            .deliver(Envelope::HttpResponse(HttpResponsePayload {
                id: "id-1".into(),
                status: 200,
                headers: Default::default(),
                body: b"hello".to_vec(),
                error: None,
            }))
            .await
            .unwrap();

        let SessionWaiter::Reply(rx) = waiter else {
            panic!("expected reply waiter");
        };
        let envelope = rx.await.unwrap().unwrap();
        assert_eq!(envelope.id(), "id-1");
    }

    #[test]
    fn duplicate_register_rejected_and_registry_unchanged() {
        let registry = SessionRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        registry
            .register("dup", SessionKind::RequestReply, deadline)
            .unwrap();
        let err = registry
            .register("dup", SessionKind::RequestReply, deadline)
            .unwrap_err();
        assert_eq!(err, SessionError::Duplicate);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn stream_session_preserves_order() {
        let registry = SessionRegistry::new();
        let waiter = registry
            .register("s1", SessionKind::ConnectStream, Instant::now() + Duration::from_secs(300))
            .unwrap();
        for i in 0..3u8 {
            registry
                .deliver(Envelope::ConnectData(ConnectDataPayload {
                    id: "s1".into(),
                    data: vec![i],
                }))
                .await
                .unwrap();
        }
        let SessionWaiter::Stream(mut rx) = waiter else {
            panic!("expected stream waiter");
        };
        for i in 0..3u8 {
            let env = rx.recv().await.unwrap().unwrap();
            match env {
                Envelope::ConnectData(p) => assert_eq!(p.data, vec![i]),
                _ => panic!("wrong variant"),
            }
        }
    }

    #[tokio::test]
    async fn deliver_to_unknown_id_fails() {
        let registry = SessionRegistry::new();
        let err = registry
            .deliver(Envelope::ConnectData(ConnectDataPayload {
                id: "ghost".into(),
                data: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Unknown);
    }

    #[tokio::test]
    async fn cancel_all_wakes_waiters_with_tunnel_lost() {
        let registry = SessionRegistry::new();
        let waiter = registry
            .register("a", SessionKind::RequestReply, Instant::now() + Duration::from_secs(30))
            .unwrap();
        registry.cancel_all(SessionError::TunnelLost);
        let SessionWaiter::Reply(rx) = waiter else {
            panic!()
        };
        assert_eq!(rx.await.unwrap().unwrap_err(), SessionError::TunnelLost);
    }

    #[test]
    fn expire_due_cancels_past_deadline_sessions() {
        let registry = SessionRegistry::new();
        registry
            .register("expired", SessionKind::RequestReply, Instant::now() - Duration::from_secs(1))
            .unwrap();
        registry
            .register("fresh", SessionKind::RequestReply, Instant::now() + Duration::from_secs(30))
            .unwrap();
        registry.expire_due();
        assert_eq!(registry.len(), 1);
    }
}
