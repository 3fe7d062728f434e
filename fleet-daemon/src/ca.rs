//! On-disk persistence of the certificate authority and the daemon's own
//! serving certificate.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_auth::{
    decode_cert_pem, decode_key_pem, extract_public_key_from_cert, is_expiring_soon,
    parse_certificate, verify_issued_by, AuthorityConfig, AuthorityError, CertificateAuthority,
};
use zeroize::Zeroizing;

use crate::tls::TlsIdentity;

/// Validity of the daemon's serving certificate.
pub const SERVER_CERT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Reissue the serving certificate when it expires within this window.
const SERVER_CERT_RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[cfg(unix)]
const KEY_MODE: u32 = 0o600;
#[cfg(unix)]
const CERT_MODE: u32 = 0o644;

/// Errors that can occur while loading or persisting CA material.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("CA configuration error: {0}")]
    Config(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

/// Load the CA from `cert_path`/`key_path`, or generate and persist a new one
/// if neither file exists.
///
/// Exactly one file present, unreadable or corrupt files, and a key that
/// does not belong to the certificate are all configuration errors.
pub fn load_or_generate(
    cert_path: &Path,
    key_path: &Path,
    config: AuthorityConfig,
) -> Result<CertificateAuthority, CaError> {
    match (cert_path.exists(), key_path.exists()) {
        (true, true) => {
            let cert_pem = read_config_file(cert_path)?;
            let key_pem = Zeroizing::new(read_config_file(key_path)?);
            let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem, config).map_err(|e| {
                CaError::Config(format!(
                    "cannot load CA from {}: {}",
                    cert_path.display(),
                    e
                ))
            })?;
            tracing::info!(subject = %ca.subject_name(), path = %cert_path.display(), "Loaded certificate authority");
            Ok(ca)
        }
        (false, false) => {
            let ca = CertificateAuthority::generate(config)?;
            // key first: a certificate on disk always has its key
            write_atomic(key_path, ca.root_key_pem().as_bytes(), FileKind::Key)?;
            write_atomic(cert_path, ca.root_cert_pem().as_bytes(), FileKind::Cert)?;
            tracing::info!(subject = %ca.subject_name(), path = %cert_path.display(), "Generated new certificate authority");
            Ok(ca)
        }
        (true, false) => Err(CaError::Config(format!(
            "CA certificate {} exists but key {} is missing",
            cert_path.display(),
            key_path.display()
        ))),
        (false, true) => Err(CaError::Config(format!(
            "CA key {} exists but certificate {} is missing",
            key_path.display(),
            cert_path.display()
        ))),
    }
}

/// Return the daemon's serving identity, issuing a new one from `ca` when
/// none is stored, the stored one was issued by a different CA, or it is
/// close to expiry.
pub fn ensure_server_identity(
    ca: &CertificateAuthority,
    cert_path: &Path,
    key_path: &Path,
    names: &[String],
) -> Result<TlsIdentity, CaError> {
    match load_server_identity(ca, cert_path, key_path) {
        Some(identity) => {
            tracing::info!(serial = %identity.serial_hex, "Using existing server certificate");
            return Ok(identity);
        }
        None => tracing::info!(names = ?names, "Issuing server certificate"),
    }

    let (cert, key) = ca.issue_server_certificate(names, SERVER_CERT_VALIDITY)?;
    write_atomic(key_path, key.to_pem().as_bytes(), FileKind::Key)?;
    write_atomic(cert_path, cert.pem().as_bytes(), FileKind::Cert)?;

    Ok(TlsIdentity {
        cert_der: cert.der,
        key_der: key.to_pkcs8_der(),
        serial_hex: cert.serial_hex,
    })
}

fn load_server_identity(
    ca: &CertificateAuthority,
    cert_path: &Path,
    key_path: &Path,
) -> Option<TlsIdentity> {
    let cert_pem = std::fs::read_to_string(cert_path).ok()?;
    let key_pem = Zeroizing::new(std::fs::read_to_string(key_path).ok()?);

    let cert_der = decode_cert_pem(&cert_pem).ok()?;
    let key = decode_key_pem(&key_pem).ok()?;

    if let Err(e) = verify_issued_by(&cert_der, ca.root_cert_der()) {
        tracing::warn!(error = %e, "Stored server certificate was not issued by this CA");
        return None;
    }
    if is_expiring_soon(&cert_der, SERVER_CERT_RENEW_BEFORE).unwrap_or(true) {
        return None;
    }
    if extract_public_key_from_cert(&cert_der).ok()? != key.public_key_raw() {
        tracing::warn!("Stored server key does not match its certificate");
        return None;
    }

    let serial_hex = parse_certificate(&cert_der).ok()?.serial_hex;
    Some(TlsIdentity {
        cert_der,
        key_der: key.to_pkcs8_der(),
        serial_hex,
    })
}

fn read_config_file(path: &Path) -> Result<String, CaError> {
    std::fs::read_to_string(path)
        .map_err(|e| CaError::Config(format!("cannot read {}: {}", path.display(), e)))
}

#[derive(Clone, Copy)]
enum FileKind {
    Key,
    Cert,
}

/// Write `contents` to a sibling temp file with the final permissions, then
/// rename it over `path`.
fn write_atomic(path: &Path, contents: &[u8], kind: FileKind) -> Result<(), CaError> {
    let io_err = |source: std::io::Error| CaError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(match kind {
            FileKind::Key => KEY_MODE,
            FileKind::Cert => CERT_MODE,
        });
    }
    #[cfg(not(unix))]
    let _ = kind;

    let mut file = options.open(&tmp_path).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(io_err)
}
