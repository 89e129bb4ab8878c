//! Peer-identity verification (§4.4 "Peer identity check").
//!
//! Both sides of the tunnel compare the handshake peer's certificate
//! against an expected identity string (an ARN-like deployment
//! identifier, per the GLOSSARY). Neither `rustls` nor `rustls-pki-types`
//! expose subject/SAN fields, so the corpus's `x509-parser` dependency
//! (seen pinned to `"0.15"` in the retrieved pack) is used to pull the
//! subject common name and subjectAltName entries out of the leaf
//! certificate's DER bytes.

use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("peer presented no certificate")]
    NoCertificate,
    #[error("peer certificate could not be parsed")]
    Unparseable,
    #[error("peer certificate identity does not match expected identity")]
    Mismatch,
}

/// Collect every identity string a certificate presents: its subject
/// common name plus every DNS/URI/email subjectAltName entry.
fn candidate_identities(der: &[u8]) -> Result<Vec<String>, IdentityError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|_| IdentityError::Unparseable)?;

    let mut identities = Vec::new();
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
    {
        identities.push(cn.to_string());
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in san.value.general_names.iter() {
            match name {
                GeneralName::DNSName(s) | GeneralName::RFC822Name(s) => {
                    identities.push(s.to_string())
                }
                GeneralName::URI(s) => identities.push(s.to_string()),
                _ => {}
            }
        }
    }

    Ok(identities)
}

/// Verify that `expected_identity` appears among the leaf certificate's
/// subject CN or SAN entries. `der` is the first (leaf) certificate from
/// the TLS handshake's peer certificate chain.
pub fn verify_peer_identity(der: &[u8], expected_identity: &str) -> Result<(), IdentityError> {
    let identities = candidate_identities(der)?;
    if identities.iter().any(|id| id == expected_identity) {
        Ok(())
    } else {
        Err(IdentityError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn self_signed_with_identity(identity: &str) -> Vec<u8> {
        let mut params = CertificateParams::new(vec![identity.to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, identity);
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        cert.der().to_vec()
    }

    #[test]
    fn matching_common_name_passes() {
        let der = self_signed_with_identity("arn:fluidity:server/test-node");
        assert!(verify_peer_identity(&der, "arn:fluidity:server/test-node").is_ok());
    }

    #[test]
    fn mismatched_identity_fails() {
        let der = self_signed_with_identity("arn:fluidity:server/test-node");
        let err = verify_peer_identity(&der, "arn:fluidity:server/other-node").unwrap_err();
        assert_eq!(err, IdentityError::Mismatch);
    }

    #[test]
    fn garbage_der_is_unparseable() {
        let err = verify_peer_identity(b"not a certificate", "anything").unwrap_err();
        assert_eq!(err, IdentityError::Unparseable);
    }
}
