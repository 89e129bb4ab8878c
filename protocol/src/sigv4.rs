//! SigV4-style request signing (§4.1 `iam_auth_request`/`iam_auth_response`,
//! §4.6 lifecycle RPC signing).
//!
//! Generalizes `auth::hmac::validate_proxy_auth`'s HMAC-SHA256 +
//! constant-time-compare scheme from a single `timestamp` component to the
//! spec's four-part canonical string (timestamp, region, service,
//! signed-headers digest), keeping the same building blocks: `hmac`+`sha2`
//! for the MAC, `subtle` for the comparison, `hex` for encoding.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SigV4Error {
    #[error("signature does not match")]
    Mismatch,
    #[error("timestamp outside accepted clock skew window")]
    ClockSkew,
    #[error("malformed signed-headers list")]
    MalformedHeaders,
}

/// One HTTP-header-like key/value pair included in the signed set, in the
/// order they should be canonicalized.
#[derive(Debug, Clone)]
pub struct SignedHeader {
    pub name: String,
    pub value: String,
}

/// The components spec.md's `iam_auth_request`/lifecycle signing describe:
/// timestamp, region, service, access key id, plus the headers actually
/// signed.
#[derive(Debug, Clone)]
pub struct SigningInput<'a> {
    pub timestamp: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub access_key_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub signed_headers: &'a [SignedHeader],
}

/// Maximum allowed difference between a presented `timestamp` and the
/// validator's clock, matching the HMAC scheme's `timestamp` window.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Canonical method/path placeholders signed by `iam_auth_request` (§4.6):
/// the tunnel handshake has no real HTTP request line, so both sides sign
/// the same fixed values instead.
pub const TUNNEL_AUTH_METHOD: &str = "TUNNEL";
pub const TUNNEL_AUTH_PATH: &str = "/tunnel/auth";

fn canonical_headers(headers: &[SignedHeader]) -> String {
    let mut sorted: Vec<&SignedHeader> = headers.iter().collect();
    sorted.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    sorted
        .iter()
        .map(|h| format!("{}:{}", h.name.to_ascii_lowercase(), h.value.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn signed_header_names(headers: &[SignedHeader]) -> String {
    let mut names: Vec<String> = headers.iter().map(|h| h.name.to_ascii_lowercase()).collect();
    names.sort();
    names.join(";")
}

/// Build the canonical string that gets HMAC'd: one line per component,
/// terminated by the canonicalized, sorted header block.
fn canonical_string(input: &SigningInput<'_>) -> String {
    format!(
        "{method}\n{path}\n{timestamp}\n{region}\n{service}\n{access_key}\n{signed_header_names}\n{canonical_headers}",
        method = input.method,
        path = input.path,
        timestamp = input.timestamp,
        region = input.region,
        service = input.service,
        access_key = input.access_key_id,
        signed_header_names = signed_header_names(input.signed_headers),
        canonical_headers = canonical_headers(input.signed_headers),
    )
}

/// Derive a per-request signing key the same way the scope string is built:
/// `HMAC(HMAC(HMAC(secret, date), region), service)`, then sign the
/// canonical string with it.
fn derive_signature(secret: &[u8], input: &SigningInput<'_>) -> String {
    let date = input.timestamp.get(..8).unwrap_or(input.timestamp);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(date.as_bytes());
    let k_date = mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&k_date).expect("HMAC accepts any key length");
    mac.update(input.region.as_bytes());
    let k_region = mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&k_region).expect("HMAC accepts any key length");
    mac.update(input.service.as_bytes());
    let k_service = mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&k_service).expect("HMAC accepts any key length");
    mac.update(canonical_string(input).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign a request, returning the hex-encoded signature to place in the
/// `iam_auth_request` payload or lifecycle RPC `Authorization` header.
pub fn sign(secret: &[u8], input: &SigningInput<'_>) -> String {
    derive_signature(secret, input)
}

/// Verify a presented signature. `now_unix` lets callers inject the clock
/// for testing; production callers pass the current Unix timestamp.
pub fn verify(
    secret: &[u8],
    input: &SigningInput<'_>,
    presented_signature: &str,
    presented_timestamp_unix: i64,
    now_unix: i64,
) -> Result<(), SigV4Error> {
    if (now_unix - presented_timestamp_unix).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(SigV4Error::ClockSkew);
    }
    if input.signed_headers.is_empty() {
        return Err(SigV4Error::MalformedHeaders);
    }
    let expected = derive_signature(secret, input);
    let matches: bool = expected
        .as_bytes()
        .ct_eq(presented_signature.as_bytes())
        .into();
    if matches {
        Ok(())
    } else {
        Err(SigV4Error::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample<'a>(headers: &'a [SignedHeader]) -> SigningInput<'a> {
        SigningInput {
            timestamp: "20260728T000000Z",
            region: "local",
            service: "fluidity-tunnel",
            access_key_id: "AKIDEXAMPLE",
            method: "POST",
            path: "/tunnel/auth",
            signed_headers: headers,
        }
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let headers = vec![SignedHeader {
            name: "host".into(),
            value: "tunnel.example".into(),
        }];
        let input = sample(&headers);
        let sig = sign(b"secret", &input);
        assert!(verify(b"secret", &input, &sig, 1_800_000_000, 1_800_000_000).is_ok());
    }

    #[test]
    fn wrong_secret_mismatches() {
        let headers = vec![SignedHeader {
            name: "host".into(),
            value: "tunnel.example".into(),
        }];
        let input = sample(&headers);
        let sig = sign(b"secret", &input);
        assert_eq!(
            verify(b"other", &input, &sig, 1_800_000_000, 1_800_000_000).unwrap_err(),
            SigV4Error::Mismatch
        );
    }

    #[test]
    fn stale_timestamp_rejected() {
        let headers = vec![SignedHeader {
            name: "host".into(),
            value: "tunnel.example".into(),
        }];
        let input = sample(&headers);
        let sig = sign(b"secret", &input);
        let err = verify(b"secret", &input, &sig, 1_800_000_000, 1_800_000_000 + 10_000).unwrap_err();
        assert_eq!(err, SigV4Error::ClockSkew);
    }

    #[test]
    fn header_order_does_not_affect_signature() {
        let a = vec![
            SignedHeader { name: "host".into(), value: "x".into() },
            SignedHeader { name: "x-node-id".into(), value: "y".into() },
        ];
        let b = vec![
            SignedHeader { name: "x-node-id".into(), value: "y".into() },
            SignedHeader { name: "host".into(), value: "x".into() },
        ];
        let sig_a = sign(b"secret", &sample(&a));
        let sig_b = sign(b"secret", &sample(&b));
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn empty_signed_headers_rejected() {
        let headers: Vec<SignedHeader> = vec![];
        let input = sample(&headers);
        let sig = sign(b"secret", &input);
        let err = verify(b"secret", &input, &sig, 1_800_000_000, 1_800_000_000).unwrap_err();
        assert_eq!(err, SigV4Error::MalformedHeaders);
    }
}
