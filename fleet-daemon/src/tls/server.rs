//! Serving configuration: the daemon's own certificate plus an optional
//! client-certificate check against the fleet root.

use std::sync::Arc;

use fleet_auth::parse_certificate;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use time::OffsetDateTime;

use super::TlsIdentity;

/// rustls server config for the check-in listener.
pub struct TlsServerConfig {
    config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// Agents that present a certificate must chain to `ca_cert_der`.
    /// Agents that present none are still accepted so they can enroll.
    pub fn new(identity: &TlsIdentity, ca_cert_der: &[u8]) -> Result<Self, TlsConfigError> {
        check_serving_window(&identity.cert_der, OffsetDateTime::now_utc())?;

        let mut agent_roots = RootCertStore::empty();
        agent_roots
            .add(CertificateDer::from(ca_cert_der.to_vec()))
            .map_err(|e| TlsConfigError::InvalidCert(e.to_string()))?;
        let agent_verifier = WebPkiClientVerifier::builder(Arc::new(agent_roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| TlsConfigError::Verifier(e.to_string()))?;

        let chain = vec![CertificateDer::from(identity.cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der.to_vec()));
        let mut config = ServerConfig::builder()
            .with_client_cert_verifier(agent_verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TlsConfigError::Config(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn into_rustls_config(self) -> Arc<ServerConfig> {
        self.config
    }
}

/// Refuse to serve with a certificate outside its validity window.
fn check_serving_window(cert_der: &[u8], now: OffsetDateTime) -> Result<(), TlsConfigError> {
    let info =
        parse_certificate(cert_der).map_err(|e| TlsConfigError::InvalidCert(e.to_string()))?;
    if now < info.not_before {
        return Err(TlsConfigError::CertNotYetValid {
            not_before: info.not_before,
        });
    }
    if now > info.not_after {
        return Err(TlsConfigError::CertExpired {
            not_after: info.not_after,
        });
    }
    Ok(())
}

/// Errors that can occur while building the serving config.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("invalid certificate: {0}")]
    InvalidCert(String),
    #[error("failed to build client verifier: {0}")]
    Verifier(String),
    #[error("failed to build server config: {0}")]
    Config(String),
    #[error("serving certificate not valid before {not_before}")]
    CertNotYetValid { not_before: OffsetDateTime },
    #[error("serving certificate expired at {not_after}")]
    CertExpired { not_after: OffsetDateTime },
}
