//! Certificate signing request generation (agent side).

use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};

use crate::keys::{KeyError, PrivateKey};

/// Errors that can occur while building a CSR.
#[derive(Debug, thiserror::Error)]
pub enum CsrError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("failed to build certificate request: {0}")]
    Build(#[from] rcgen::Error),
}

/// Create a DER-encoded PKCS#10 request for `key`.
///
/// The subject common name is `subject` (the agent id, or a placeholder
/// before one is assigned). The hostname is carried as a DNS SAN when it is
/// a valid DNS name; otherwise it is omitted.
pub fn create_csr(key: &PrivateKey, subject: &str, hostname: &str) -> Result<Vec<u8>, CsrError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    if is_dns_name(hostname) {
        params
            .subject_alt_names
            .push(SanType::DnsName(hostname.to_string().try_into()?));
    }

    let request = params.serialize_request(key.key_pair())?;
    Ok(request.der().to_vec())
}

fn is_dns_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Generate a fresh key and a CSR for it in one step.
pub fn generate_key_and_csr(
    subject: &str,
    hostname: &str,
) -> Result<(PrivateKey, Vec<u8>), CsrError> {
    let key = PrivateKey::generate()?;
    let csr = create_csr(&key, subject, hostname)?;
    Ok((key, csr))
}
