use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::server::WebPkiClientVerifier;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::config::Config;

/// Build the mTLS acceptor for the tunnel listener (§4.4/§6.2): TLS 1.3
/// only, client certificates required and verified against the shared CA
/// bundle. Generalizes `aether-proxy::proxy::tls::build_tls_acceptor`'s
/// server-auth-only acceptor to mutual authentication.
pub fn build_tunnel_acceptor(config: &Config) -> anyhow::Result<TlsAcceptor> {
    let mut roots = rustls::RootCertStore::empty();
    let ca_file = fs::File::open(&config.tls_ca_path)
        .with_context(|| format!("opening CA bundle {}", config.tls_ca_path))?;
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca_file)) {
        roots.add(cert?)?;
    }
    let roots = Arc::new(roots);

    let client_verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .context("building mutual-auth client certificate verifier")?;

    let cert_file = fs::File::open(&config.tls_cert_path)
        .with_context(|| format!("opening server certificate {}", config.tls_cert_path))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", config.tls_cert_path);
    }

    let key_file = fs::File::open(&config.tls_key_path)
        .with_context(|| format!("opening server private key {}", config.tls_key_path))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", config.tls_key_path))?;

    let mut tls_config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .context("building mutual-auth TLS server config")?;
    tls_config.alpn_protocols = vec![b"fluidity/1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Self-signed certificate bootstrap for the health listener only (§6.4 is
/// plain HTTP in production; this exists purely so a local/dev run has
/// *something* to present if the operator points a TLS-terminating load
/// balancer at it). Grounded on
/// `aether-proxy::proxy::tls::ensure_self_signed_cert`.
pub fn ensure_self_signed_cert(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }

    info!("generating self-signed certificate for the health listener");

    let mut params = CertificateParams::new(vec!["localhost".into(), "fluidity-server".into()])?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "fluidity-server");

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    fs::write(cert_path, cert.pem())?;
    fs::write(key_path, key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Build a `TlsConnector` purely for test fixtures that need to dial a
/// locally generated certificate. Not used by the server's own listeners.
#[cfg(test)]
pub fn test_connector(roots: rustls::RootCertStore) -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
