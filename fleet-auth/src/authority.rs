//! Private certificate authority.
//!
//! The authority owns a self-signed ECDSA P-256 root and signs agent CSRs
//! into short-lived client certificates. It also issues the daemon's own
//! serving certificate.
//!
//! Every certificate it produces is backdated by [`AuthorityConfig::clock_skew`]
//! so that hosts with slightly slow clocks accept it immediately.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use ::time::OffsetDateTime;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::cert::serial_to_hex;
use crate::encoding::{decode_cert_pem, encode_cert_pem, PemError};
use crate::keys::{KeyError, PrivateKey};

/// Size of random certificate serials.
const SERIAL_BYTES: usize = 16;

/// Subject common name of the daemon's serving certificate.
pub const SERVER_COMMON_NAME: &str = "fleet-daemon";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Authority settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// O= field of every certificate, and the root CN prefix.
    pub organization: String,
    /// Leaf validity used when a caller passes a zero validity.
    pub default_validity: Duration,
    /// Root certificate validity.
    pub ca_validity: Duration,
    /// NotBefore backdating applied to root and leaf certificates.
    pub clock_skew: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            organization: "Fleet".to_string(),
            default_validity: 90 * DAY,
            ca_validity: 10 * 365 * DAY,
            clock_skew: Duration::from_secs(5 * 60),
        }
    }
}

/// Errors raised by the authority.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("invalid certificate request: {0}")]
    InvalidCsr(String),

    #[error("invalid root certificate: {0}")]
    InvalidRoot(String),

    #[error("root key does not match root certificate")]
    KeyMismatch,

    #[error(transparent)]
    Pem(#[from] PemError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

/// A freshly issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub der: Vec<u8>,
    /// Serial as lowercase hex.
    pub serial_hex: String,
    pub not_before: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl SignedCertificate {
    pub fn pem(&self) -> String {
        encode_cert_pem(&self.der)
    }
}

/// The certificate authority.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_der: Vec<u8>,
    root_pem: String,
    subject_name: String,
    organization: String,
    config: AuthorityConfig,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject_name", &self.subject_name)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a new root key and self-signed root certificate.
    pub fn generate(config: AuthorityConfig) -> Result<Self, AuthorityError> {
        let key = KeyPair::generate()?;
        let subject_name = format!("{} Internal CA", config.organization);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, config.organization.as_str());
        dn.push(DnType::CommonName, subject_name.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - config.clock_skew;
        params.not_after = now + config.ca_validity;

        let cert = params.self_signed(&key)?;
        let root_der = cert.der().to_vec();

        Ok(Self {
            root_pem: encode_cert_pem(&root_der),
            root_der,
            organization: config.organization.clone(),
            subject_name,
            issuer: Issuer::new(params, key),
            config,
        })
    }

    /// Load an existing root from PEM text.
    ///
    /// Fails if the certificate is not a CA or the key does not belong to it.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        config: AuthorityConfig,
    ) -> Result<Self, AuthorityError> {
        let root_der = decode_cert_pem(cert_pem)?;
        let key = PrivateKey::from_pem(key_pem)?;

        let (organization, subject_name) = {
            let (_, cert) = X509Certificate::from_der(&root_der)
                .map_err(|e| AuthorityError::InvalidRoot(e.to_string()))?;
            if !cert.is_ca() {
                return Err(AuthorityError::InvalidRoot(
                    "certificate is not a CA".to_string(),
                ));
            }
            if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
                return Err(AuthorityError::KeyMismatch);
            }
            let organization = cert
                .subject()
                .iter_organization()
                .next()
                .and_then(|o| o.as_str().ok())
                .unwrap_or(config.organization.as_str())
                .to_string();
            let subject_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string();
            (organization, subject_name)
        };

        let issuer = Issuer::from_ca_cert_der(&root_der.as_slice().into(), key.into_key_pair())
            .map_err(|e| AuthorityError::InvalidRoot(e.to_string()))?;

        Ok(Self {
            issuer,
            root_pem: encode_cert_pem(&root_der),
            root_der,
            subject_name,
            organization,
            config,
        })
    }

    /// Sign a DER-encoded CSR into a client certificate for `subject_id`.
    ///
    /// The CSR self-signature is verified; its requested subject and
    /// extensions are ignored. A zero `validity` uses the configured default.
    pub fn sign_csr(
        &self,
        csr_der: &[u8],
        subject_id: &str,
        validity: Duration,
    ) -> Result<SignedCertificate, AuthorityError> {
        let csr = CertificateSigningRequestParams::from_der(&csr_der.into())
            .map_err(|e| AuthorityError::InvalidCsr(e.to_string()))?;

        let validity = if validity.is_zero() {
            self.config.default_validity
        } else {
            validity
        };

        let mut params = self.leaf_params(subject_id, validity);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let cert = params.signed_by(&csr.public_key, &self.issuer)?;
        Ok(self.signed(cert.der().to_vec(), &params))
    }

    /// Issue a serving certificate for the daemon with the given SANs.
    ///
    /// Returns the certificate together with its freshly generated key.
    pub fn issue_server_certificate(
        &self,
        names: &[String],
        validity: Duration,
    ) -> Result<(SignedCertificate, PrivateKey), AuthorityError> {
        let key = PrivateKey::generate()?;

        let mut params = self.leaf_params(SERVER_COMMON_NAME, validity);
        params.subject_alt_names = CertificateParams::new(names.to_vec())?.subject_alt_names;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params.signed_by(key.key_pair(), &self.issuer)?;
        Ok((self.signed(cert.der().to_vec(), &params), key))
    }

    fn leaf_params(&self, common_name: &str, validity: Duration) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, self.organization.as_str());
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - self.config.clock_skew;
        params.not_after = now + validity;
        params
    }

    fn signed(&self, der: Vec<u8>, params: &CertificateParams) -> SignedCertificate {
        let serial = params
            .serial_number
            .as_ref()
            .map(|s| s.to_bytes())
            .unwrap_or_default();
        SignedCertificate {
            der,
            serial_hex: serial_to_hex(&serial),
            not_before: params.not_before,
            expires_at: params.not_after,
        }
    }

    /// DER bytes of the root certificate.
    pub fn root_cert_der(&self) -> &[u8] {
        &self.root_der
    }

    /// PEM text of the root certificate, for distribution to agents.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_pem
    }

    /// PEM text of the root key, for persistence by the caller.
    pub fn root_key_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(self.issuer.key().serialize_pem())
    }

    /// Root subject common name.
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }
}

/// 128-bit random positive serial with no leading zero byte.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_BYTES];
    OsRng.fill_bytes(&mut bytes);
    // keep the encoding at a fixed length; the DER writer adds the sign byte
    if bytes[0] == 0 {
        bytes[0] = 1;
    }
    SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{parse_certificate, verify_issued_by};
    use crate::csr::generate_key_and_csr;
    use std::collections::HashSet;

    fn ca() -> CertificateAuthority {
        CertificateAuthority::generate(AuthorityConfig::default()).unwrap()
    }

    fn csr() -> Vec<u8> {
        generate_key_and_csr("pending", "host-01").unwrap().1
    }

    #[test]
    fn test_root_is_constrained_ca() {
        let ca = ca();
        let (_, cert) = X509Certificate::from_der(ca.root_cert_der()).unwrap();

        let bc = cert.basic_constraints().unwrap().unwrap().value;
        assert!(bc.ca);
        assert_eq!(bc.path_len_constraint, Some(1));

        let ku = cert.key_usage().unwrap().unwrap().value;
        assert!(ku.key_cert_sign());
        assert!(ku.digital_signature());
        assert!(ku.crl_sign());

        assert_eq!(ca.subject_name(), "Fleet Internal CA");
        assert!(ca.root_cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_root_is_backdated_by_clock_skew() {
        let config = AuthorityConfig {
            clock_skew: Duration::from_secs(600),
            ..AuthorityConfig::default()
        };
        let before = OffsetDateTime::now_utc();
        let ca = CertificateAuthority::generate(config).unwrap();
        let info = parse_certificate(ca.root_cert_der()).unwrap();

        let skew = before - info.not_before;
        assert!(skew >= ::time::Duration::seconds(599), "skew was {skew}");
        assert!(skew <= ::time::Duration::seconds(602), "skew was {skew}");
    }

    #[test]
    fn test_sign_csr_produces_client_leaf() {
        let ca = ca();
        let leaf = ca.sign_csr(&csr(), "agent-42", Duration::ZERO).unwrap();

        let (_, cert) = X509Certificate::from_der(&leaf.der).unwrap();
        let (_, root) = X509Certificate::from_der(ca.root_cert_der()).unwrap();
        assert_eq!(cert.issuer().as_raw(), root.subject().as_raw());

        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "agent-42");
        let org = cert.subject().iter_organization().next().unwrap();
        assert_eq!(org.as_str().unwrap(), "Fleet");

        let ku = cert.key_usage().unwrap().unwrap().value;
        assert!(ku.digital_signature());
        assert!(ku.key_encipherment());
        assert!(!ku.key_cert_sign());

        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.client_auth);
        assert!(!eku.server_auth);

        verify_issued_by(&leaf.der, ca.root_cert_der()).unwrap();
    }

    #[test]
    fn test_default_validity_applies_when_zero() {
        let ca = ca();
        let leaf = ca.sign_csr(&csr(), "agent-1", Duration::ZERO).unwrap();
        let info = parse_certificate(&leaf.der).unwrap();

        assert!(info.not_before <= OffsetDateTime::now_utc());
        let span = info.not_after - info.not_before;
        let expected = ::time::Duration::days(90) + ::time::Duration::minutes(5);
        assert!((span - expected).abs() <= ::time::Duration::seconds(2), "span was {span}");
        assert_eq!(info.not_after.unix_timestamp(), leaf.expires_at.unix_timestamp());
    }

    #[test]
    fn test_custom_validity() {
        let ca = ca();
        let leaf = ca.sign_csr(&csr(), "agent-1", 30 * DAY).unwrap();
        let info = parse_certificate(&leaf.der).unwrap();

        let lifetime = info.not_after - OffsetDateTime::now_utc();
        assert!(lifetime <= ::time::Duration::days(30));
        assert!(lifetime > ::time::Duration::days(30) - ::time::Duration::minutes(1));
    }

    #[test]
    fn test_serials_are_unique() {
        let ca = ca();
        let csr = csr();
        let serials: HashSet<String> = (0..10)
            .map(|_| ca.sign_csr(&csr, "same-agent", Duration::ZERO).unwrap().serial_hex)
            .collect();
        assert_eq!(serials.len(), 10);
    }

    #[test]
    fn test_serial_matches_certificate() {
        let ca = ca();
        let leaf = ca.sign_csr(&csr(), "agent-1", Duration::ZERO).unwrap();
        assert_eq!(parse_certificate(&leaf.der).unwrap().serial_hex, leaf.serial_hex);
        assert_eq!(leaf.serial_hex.len(), SERIAL_BYTES * 2);
    }

    #[test]
    fn test_rejects_malformed_csr() {
        let result = ca().sign_csr(b"garbage", "agent-1", Duration::ZERO);
        assert!(matches!(result, Err(AuthorityError::InvalidCsr(_))));
    }

    #[test]
    fn test_rejects_tampered_csr() {
        let mut der = csr();
        let last = der.len() - 1;
        der[last] ^= 0x01;
        let result = ca().sign_csr(&der, "agent-1", Duration::ZERO);
        assert!(matches!(result, Err(AuthorityError::InvalidCsr(_))));
    }

    #[test]
    fn test_reload_from_pem_keeps_signing() {
        let original = ca();
        let reloaded = CertificateAuthority::from_pem(
            original.root_cert_pem(),
            &original.root_key_pem(),
            AuthorityConfig::default(),
        )
        .unwrap();

        assert_eq!(reloaded.root_cert_der(), original.root_cert_der());
        assert_eq!(reloaded.subject_name(), original.subject_name());
        assert_eq!(reloaded.organization(), "Fleet");

        let leaf = reloaded.sign_csr(&csr(), "agent-9", Duration::ZERO).unwrap();
        verify_issued_by(&leaf.der, original.root_cert_der()).unwrap();
    }

    #[test]
    fn test_from_pem_rejects_foreign_key() {
        let a = ca();
        let b = ca();
        let result =
            CertificateAuthority::from_pem(a.root_cert_pem(), &b.root_key_pem(), a.config().clone());
        assert!(matches!(result, Err(AuthorityError::KeyMismatch)));
    }

    #[test]
    fn test_from_pem_rejects_leaf_as_root() {
        let ca = ca();
        let leaf = ca.sign_csr(&csr(), "agent-1", Duration::ZERO).unwrap();
        let result =
            CertificateAuthority::from_pem(&leaf.pem(), &ca.root_key_pem(), ca.config().clone());
        assert!(matches!(result, Err(AuthorityError::InvalidRoot(_))));
    }

    #[test]
    fn test_server_certificate_carries_names() {
        let ca = ca();
        let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let (cert, key) = ca.issue_server_certificate(&names, 365 * DAY).unwrap();

        let (_, parsed) = X509Certificate::from_der(&cert.der).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap().value;
        assert_eq!(san.general_names.len(), 2);
        let eku = parsed.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);

        let cn = parsed.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), SERVER_COMMON_NAME);
        assert_eq!(
            parsed.public_key().subject_public_key.data.as_ref(),
            key.public_key_raw()
        );
    }
}
