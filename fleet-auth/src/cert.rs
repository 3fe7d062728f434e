//! Certificate utilities for X.509 parsing.
//!
//! # Security
//!
//! - Input is limited to 16KB to prevent DoS
//! - The x509_parser library handles ASN.1 parsing safely

use std::time::Duration;

use thiserror::Error;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;

/// Maximum certificate size (16KB is generous for a single cert)
pub const MAX_CERT_SIZE: usize = 16 * 1024;

/// Errors that can occur during certificate parsing.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate too large: {0} bytes (max {MAX_CERT_SIZE})")]
    TooLarge(usize),

    #[error("failed to parse X.509 certificate: {0}")]
    ParseError(String),

    #[error("certificate was not issued by the given authority: {0}")]
    NotIssuedBy(String),
}

/// The parts of a certificate the fleet cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name (the agent id for leaf certificates).
    pub subject_cn: String,
    /// Issuer common name.
    pub issuer_cn: String,
    /// Serial as lowercase hex, without leading zero bytes.
    pub serial_hex: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Whether the certificate expires within `threshold` of `now`.
    ///
    /// An already expired certificate is always expiring.
    pub fn expires_within(&self, threshold: Duration, now: OffsetDateTime) -> bool {
        self.not_after <= now + threshold
    }
}

fn parse_x509(cert_der: &[u8]) -> Result<X509Certificate<'_>, CertError> {
    // Input size validation (DoS protection)
    if cert_der.len() > MAX_CERT_SIZE {
        return Err(CertError::TooLarge(cert_der.len()));
    }

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertError::ParseError(format!("{:?}", e)))?;
    Ok(cert)
}

fn common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Strip the DER sign padding so serials print the same way they were issued.
pub(crate) fn serial_to_hex(raw: &[u8]) -> String {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    if start == raw.len() {
        return "00".to_string();
    }
    hex::encode(&raw[start..])
}

/// Parse a DER-encoded certificate into [`CertificateInfo`].
pub fn parse_certificate(cert_der: &[u8]) -> Result<CertificateInfo, CertError> {
    let cert = parse_x509(cert_der)?;
    let validity = cert.validity();

    Ok(CertificateInfo {
        subject_cn: common_name(cert.subject()),
        issuer_cn: common_name(cert.issuer()),
        serial_hex: serial_to_hex(cert.raw_serial()),
        not_before: validity.not_before.to_datetime(),
        not_after: validity.not_after.to_datetime(),
        is_ca: cert.is_ca(),
    })
}

/// Check whether a certificate expires within `threshold` from now.
pub fn is_expiring_soon(cert_der: &[u8], threshold: Duration) -> Result<bool, CertError> {
    let info = parse_certificate(cert_der)?;
    Ok(info.expires_within(threshold, OffsetDateTime::now_utc()))
}

/// Verify that `leaf_der` names `ca_der` as issuer and carries a valid
/// signature from its key.
pub fn verify_issued_by(leaf_der: &[u8], ca_der: &[u8]) -> Result<(), CertError> {
    let leaf = parse_x509(leaf_der)?;
    let ca = parse_x509(ca_der)?;

    if leaf.issuer().as_raw() != ca.subject().as_raw() {
        return Err(CertError::NotIssuedBy(format!(
            "issuer {} does not match {}",
            leaf.issuer(),
            ca.subject()
        )));
    }

    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|e| CertError::NotIssuedBy(e.to_string()))
}

/// Extract raw public key bytes from a DER-encoded X.509 certificate.
///
/// # Errors
///
/// Returns `CertError::TooLarge` if certificate exceeds 16KB.
/// Returns `CertError::ParseError` if the certificate is malformed.
pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Result<Vec<u8>, CertError> {
    let cert = parse_x509(cert_der)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityConfig, CertificateAuthority};
    use crate::csr::generate_key_and_csr;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_cert_too_large() {
        let large_data = vec![0u8; MAX_CERT_SIZE + 1];
        let result = extract_public_key_from_cert(&large_data);
        assert!(matches!(result, Err(CertError::TooLarge(_))));
    }

    #[test]
    fn test_invalid_cert() {
        let invalid_data = b"not a certificate";
        let result = extract_public_key_from_cert(invalid_data);
        assert!(matches!(result, Err(CertError::ParseError(_))));
    }

    #[test]
    fn test_serial_to_hex_strips_padding() {
        assert_eq!(serial_to_hex(&[0x00, 0x8f, 0x01]), "8f01");
        assert_eq!(serial_to_hex(&[0x0a]), "0a");
        assert_eq!(serial_to_hex(&[0x00]), "00");
    }

    #[test]
    fn test_leaf_info_and_chain() {
        let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
        let (key, csr) = generate_key_and_csr("pending", "host-01").unwrap();
        let leaf = ca.sign_csr(&csr, "agent-7", 10 * DAY).unwrap();

        let info = parse_certificate(&leaf.der).unwrap();
        assert_eq!(info.subject_cn, "agent-7");
        assert_eq!(info.issuer_cn, ca.subject_name());
        assert_eq!(info.serial_hex, leaf.serial_hex);
        assert!(!info.is_ca);

        verify_issued_by(&leaf.der, ca.root_cert_der()).unwrap();
        assert_eq!(
            extract_public_key_from_cert(&leaf.der).unwrap(),
            key.public_key_raw()
        );
    }

    #[test]
    fn test_verify_rejects_foreign_authority() {
        let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
        let other = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
        let (_key, csr) = generate_key_and_csr("pending", "host-01").unwrap();
        let leaf = ca.sign_csr(&csr, "agent-7", DAY).unwrap();

        // same subject name, different key
        let result = verify_issued_by(&leaf.der, other.root_cert_der());
        assert!(matches!(result, Err(CertError::NotIssuedBy(_))));
    }

    #[test]
    fn test_expiring_soon_threshold() {
        let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
        let (_key, csr) = generate_key_and_csr("pending", "host-01").unwrap();
        let leaf = ca.sign_csr(&csr, "agent-7", 10 * DAY).unwrap();

        assert!(is_expiring_soon(&leaf.der, 30 * DAY).unwrap());
        assert!(!is_expiring_soon(&leaf.der, DAY).unwrap());
    }
}
