use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsConnector;

use crate::config::Config;

/// Build a mutually authenticated TLS client config: presents the agent's
/// own certificate and validates the server's certificate against the
/// configured CA bundle. Generalizes
/// `aether-proxy::tunnel::client::build_tls_config`'s server-auth-only
/// `webpki-roots` setup to mutual auth, per §4.4/§6.2.
pub fn build_connector(config: &Config) -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    let ca_file = fs::File::open(&config.tls_ca_path)
        .with_context(|| format!("opening CA bundle {}", config.tls_ca_path))?;
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca_file)) {
        roots.add(cert?)?;
    }

    let cert_file = fs::File::open(&config.tls_cert_path)
        .with_context(|| format!("opening agent certificate {}", config.tls_cert_path))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", config.tls_cert_path);
    }

    let key_file = fs::File::open(&config.tls_key_path)
        .with_context(|| format!("opening agent private key {}", config.tls_key_path))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", config.tls_key_path))?;

    let mut tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("building mutual-auth TLS client config")?;
    tls_config.alpn_protocols = vec![b"fluidity/1".to_vec()];

    Ok(TlsConnector::from(Arc::new(tls_config)))
}
