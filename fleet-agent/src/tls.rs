//! TLS client configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_auth::PrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore};
use tonic::transport::Channel;

/// Build a client config trusting only `ca_der`.
///
/// With `client_auth`, the leaf certificate and key are presented to the
/// server for mutual authentication.
pub fn build_client_config(
    ca_der: &[u8],
    client_auth: Option<(&[u8], &PrivateKey)>,
) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_der.to_vec()))
        .context("Invalid CA certificate")?;
    let builder = ClientConfig::builder().with_root_certificates(Arc::new(roots));

    match client_auth {
        Some((cert_der, key)) => {
            let key_der =
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_pkcs8_der().to_vec()));
            builder
                .with_client_auth_cert(vec![CertificateDer::from(cert_der.to_vec())], key_der)
                .context("Invalid client certificate")
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Build a TLS channel with the given configuration.
///
/// Converts HTTP addresses to HTTPS and creates a tonic Channel
/// using the provided TLS config.
pub async fn build_tls_channel(
    addr: &str,
    tls_config: ClientConfig,
    connect_timeout: Duration,
) -> Result<Channel> {
    let tls_addr = addr.replace("http://", "https://");
    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_only()
        .enable_http2()
        .build();
    Channel::from_shared(tls_addr)?
        .connect_timeout(connect_timeout)
        .connect_with_connector(https_connector)
        .await
        .context("Failed to connect via TLS")
}

/// Connect without TLS.
pub async fn build_plaintext_channel(addr: &str, connect_timeout: Duration) -> Result<Channel> {
    let plain_addr = addr.replace("https://", "http://");
    Channel::from_shared(plain_addr)?
        .connect_timeout(connect_timeout)
        .connect()
        .await
        .context("Failed to connect")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_auth::{generate_key_and_csr, AuthorityConfig, CertificateAuthority};

    #[test]
    fn test_client_config_with_and_without_identity() {
        let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
        let (key, csr) = generate_key_and_csr("agent-1", "web-01").unwrap();
        let leaf = ca.sign_csr(&csr, "agent-1", Duration::ZERO).unwrap();

        let anonymous = build_client_config(ca.root_cert_der(), None).unwrap();
        assert!(!anonymous.client_auth_cert_resolver.has_certs());

        let mutual = build_client_config(ca.root_cert_der(), Some((&leaf.der, &key))).unwrap();
        assert!(mutual.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_garbage_root_is_rejected() {
        assert!(build_client_config(b"not a certificate", None).is_err());
    }
}
