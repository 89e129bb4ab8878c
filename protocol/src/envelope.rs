//! JSON envelope wire format for the Agent<->Server tunnel.
//!
//! Frame layout (newline-delimited JSON, see §4.1/§6.2):
//! one JSON object per line, `{"type": "...", "payload": {...}}`, terminated
//! by `\n`. Binary payload fields are base64 strings inside the JSON object.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Maximum size of a single encoded envelope, including the trailing newline.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope exceeds maximum size of {max} bytes")]
    TooLarge { max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("duplicate session id: {0}")]
    DuplicateId(String),
    #[error("tunnel connection closed")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Header map preserving multiple values per name (§4.1 `http_request`/`ws_open`).
pub type HeaderMap = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRequestPayload {
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResponsePayload {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectOpenPayload {
    pub id: String,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectAckPayload {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectDataPayload {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectClosePayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsOpenPayload {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsAckPayload {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsMessagePayload {
    pub id: String,
    pub binary: bool,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsClosePayload {
    pub id: String,
    #[serde(default)]
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IamAuthRequestPayload {
    pub id: String,
    pub timestamp: u64,
    pub region: String,
    pub service: String,
    pub access_key_id: String,
    pub signature: String,
    #[serde(default)]
    pub signed_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IamAuthResponsePayload {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The complete set of recognized tunnel messages (§4.1). Any other `type`
/// tag fails deserialization with `ProtocolError::UnknownType`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    HttpRequest(HttpRequestPayload),
    HttpResponse(HttpResponsePayload),
    ConnectOpen(ConnectOpenPayload),
    ConnectAck(ConnectAckPayload),
    ConnectData(ConnectDataPayload),
    ConnectClose(ConnectClosePayload),
    WsOpen(WsOpenPayload),
    WsAck(WsAckPayload),
    WsMessage(WsMessagePayload),
    WsClose(WsClosePayload),
    IamAuthRequest(IamAuthRequestPayload),
    IamAuthResponse(IamAuthResponsePayload),
}

impl Envelope {
    /// The correlation ID every envelope carries (§3.1 invariant).
    pub fn id(&self) -> &str {
        match self {
            Envelope::HttpRequest(p) => &p.id,
            Envelope::HttpResponse(p) => &p.id,
            Envelope::ConnectOpen(p) => &p.id,
            Envelope::ConnectAck(p) => &p.id,
            Envelope::ConnectData(p) => &p.id,
            Envelope::ConnectClose(p) => &p.id,
            Envelope::WsOpen(p) => &p.id,
            Envelope::WsAck(p) => &p.id,
            Envelope::WsMessage(p) => &p.id,
            Envelope::WsClose(p) => &p.id,
            Envelope::IamAuthRequest(p) => &p.id,
            Envelope::IamAuthResponse(p) => &p.id,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Envelope::HttpRequest(_) => "http_request",
            Envelope::HttpResponse(_) => "http_response",
            Envelope::ConnectOpen(_) => "connect_open",
            Envelope::ConnectAck(_) => "connect_ack",
            Envelope::ConnectData(_) => "connect_data",
            Envelope::ConnectClose(_) => "connect_close",
            Envelope::WsOpen(_) => "ws_open",
            Envelope::WsAck(_) => "ws_ack",
            Envelope::WsMessage(_) => "ws_message",
            Envelope::WsClose(_) => "ws_close",
            Envelope::IamAuthRequest(_) => "iam_auth_request",
            Envelope::IamAuthResponse(_) => "iam_auth_response",
        }
    }

    pub fn is_iam_auth(&self) -> bool {
        matches!(self, Envelope::IamAuthRequest(_) | Envelope::IamAuthResponse(_))
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf =
            serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if buf.len() + 1 > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::TooLarge {
                max: MAX_ENVELOPE_SIZE,
            });
        }
        buf.push(b'\n');
        Ok(buf)
    }

    /// Decode a single line (without its trailing newline).
    pub fn decode_line(line: &[u8]) -> Result<Self, ProtocolError> {
        if line.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::TooLarge {
                max: MAX_ENVELOPE_SIZE,
            });
        }
        // serde_json's internal #[serde(tag, content)] handling surfaces an
        // "unknown variant" error for unrecognized `type` tags; normalize
        // that (and any other parse failure) into our own taxonomy.
        serde_json::from_slice::<serde_json::Value>(line)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
            .and_then(|v| {
                let type_tag = v
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(|s| s.to_string());
                serde_json::from_value::<Envelope>(v).map_err(|e| match type_tag {
                    Some(t) if !KNOWN_TAGS.contains(&t.as_str()) => ProtocolError::UnknownType(t),
                    _ => ProtocolError::Malformed(e.to_string()),
                })
            })
    }
}

const KNOWN_TAGS: &[&str] = &[
    "http_request",
    "http_response",
    "connect_open",
    "connect_ack",
    "connect_data",
    "connect_close",
    "ws_open",
    "ws_ack",
    "ws_message",
    "ws_close",
    "iam_auth_request",
    "iam_auth_response",
];

/// Write a single envelope to an async writer.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let line = envelope.encode_line()?;
    writer.write_all(&line).await?;
    Ok(())
}

/// Read a single envelope from a buffered async reader.
///
/// Returns `Ok(None)` on clean EOF (no partial line pending).
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, ProtocolError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_ENVELOPE_SIZE as u64 + 1);
    let n = limited.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() as u64 > MAX_ENVELOPE_SIZE as u64 {
        return Err(ProtocolError::TooLarge {
            max: MAX_ENVELOPE_SIZE,
        });
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Envelope::decode_line(&line).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::HttpRequest(HttpRequestPayload {
            id: "abc123".to_string(),
            method: "GET".to_string(),
            url: "http://target.example/path".to_string(),
            headers: HeaderMap::from([("accept".to_string(), vec!["*/*".to_string()])]),
            body: b"hello binary \x00\x01".to_vec(),
        })
    }

    #[test]
    fn round_trip_preserves_binary_body() {
        let env = sample();
        let line = env.encode_line().unwrap();
        let mut trimmed = line.clone();
        trimmed.pop();
        let decoded = Envelope::decode_line(&trimmed).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let line = br#"{"type":"bogus_type","payload":{"id":"x"}}"#;
        let err = Envelope::decode_line(line).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "bogus_type"));
    }

    #[test]
    fn oversized_envelope_rejected_at_exactly_one_byte_over() {
        let big_body = vec![0u8; MAX_ENVELOPE_SIZE];
        let env = Envelope::ConnectData(ConnectDataPayload {
            id: "s1".to_string(),
            data: big_body,
        });
        assert!(matches!(
            env.encode_line(),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn async_round_trip_over_a_pipe() {
        let (mut client, server) = tokio::io::duplex(1024 * 1024);
        let env = sample();
        write_envelope(&mut client, &env).await.unwrap();
        drop(client);
        let mut reader = tokio::io::BufReader::new(server);
        let decoded = read_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(env, decoded);
        assert!(read_envelope(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn ids_and_tags_match_every_variant() {
        let cases: Vec<(Envelope, &str)> = vec![
            (sample(), "http_request"),
            (
                Envelope::ConnectOpen(ConnectOpenPayload {
                    id: "s1".into(),
                    host: "target.example:443".into(),
                }),
                "connect_open",
            ),
            (
                Envelope::WsClose(WsClosePayload {
                    id: "s2".into(),
                    code: 1000,
                    reason: None,
                }),
                "ws_close",
            ),
        ];
        for (env, tag) in cases {
            assert_eq!(env.type_tag(), tag);
            assert!(!env.id().is_empty());
        }
    }
}
