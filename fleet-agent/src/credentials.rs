//! On-disk credential store for the agent's leaf key, leaf certificate and
//! trusted root.
//!
//! Everything is stored as PEM under the configured certificate directory.
//! Writes go to a `.new` file first and are renamed into place, so a reader
//! never sees a partially written file. Renewal stages both the key and the
//! certificate before either is renamed; if the process dies between the two
//! renames, the next load finds the staged certificate and finishes the swap
//! instead of pairing a new key with an old certificate.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fleet_auth::{
    decode_cert_pem, decode_key_pem, encode_cert_pem, extract_public_key_from_cert, CertError,
    PemError, PrivateKey,
};
use thiserror::Error;

use crate::config::AgentConfig;

/// Errors from reading or writing credential files.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Pem { path: PathBuf, source: PemError },

    #[error("certificate: {0}")]
    Certificate(#[from] CertError),

    #[error("agent.crt does not belong to agent.key")]
    Mismatch,
}

/// Leaf key and certificate plus the root that issued them.
pub struct Identity {
    pub key: PrivateKey,
    pub cert_der: Vec<u8>,
    pub ca_der: Vec<u8>,
}

/// File-backed credential store rooted at one directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.cert_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join("agent.key")
    }

    fn cert_path(&self) -> PathBuf {
        self.dir.join("agent.crt")
    }

    fn ca_path(&self) -> PathBuf {
        self.dir.join("ca.crt")
    }

    /// Whether a full key, certificate and root set is on disk.
    pub fn has_identity(&self) -> bool {
        self.key_path().exists() && self.cert_path().exists() && self.ca_path().exists()
    }

    /// Whether a trusted root is on disk.
    pub fn has_ca(&self) -> bool {
        self.ca_path().exists()
    }

    pub fn load_ca(&self) -> Result<Vec<u8>, CredentialError> {
        read_cert(&self.ca_path())
    }

    pub fn load_certificate(&self) -> Result<Vec<u8>, CredentialError> {
        read_cert(&self.cert_path())
    }

    /// Load the active key/certificate pair and the root.
    ///
    /// Completes an interrupted renewal swap first. A certificate whose
    /// public key differs from the key file is refused.
    pub fn load_identity(&self) -> Result<Identity, CredentialError> {
        let key_path = self.key_path();
        let key_pem = read_string(&key_path)?;
        let key = decode_key_pem(&key_pem).map_err(|source| CredentialError::Pem {
            path: key_path,
            source,
        })?;

        let mut cert_der = self.load_certificate()?;
        if !belongs_to(&cert_der, &key)? {
            let staged = staged_path(&self.cert_path());
            if !staged.exists() {
                return Err(CredentialError::Mismatch);
            }
            let staged_der = read_cert(&staged)?;
            if !belongs_to(&staged_der, &key)? {
                return Err(CredentialError::Mismatch);
            }
            tracing::warn!("completing interrupted certificate swap");
            rename(&staged, &self.cert_path())?;
            cert_der = staged_der;
        }

        Ok(Identity {
            key,
            cert_der,
            ca_der: self.load_ca()?,
        })
    }

    /// Persist a freshly generated key ahead of the enrollment call.
    pub fn save_key(&self, key: &PrivateKey) -> Result<(), CredentialError> {
        self.ensure_dir()?;
        write_atomic(&self.key_path(), key.to_pem().as_bytes(), PRIVATE_MODE)
    }

    /// Persist a leaf certificate and root for the key already on disk.
    pub fn save_certificates(&self, cert_der: &[u8], ca_der: &[u8]) -> Result<(), CredentialError> {
        self.ensure_dir()?;
        write_atomic(&self.ca_path(), encode_cert_pem(ca_der).as_bytes(), PUBLIC_MODE)?;
        write_atomic(&self.cert_path(), encode_cert_pem(cert_der).as_bytes(), PRIVATE_MODE)
    }

    /// Swap in a renewed key and certificate.
    ///
    /// Both files are staged before the key is renamed into place, and the
    /// certificate follows. The previous pair stays active until then.
    pub fn install_renewal(
        &self,
        key: &PrivateKey,
        cert_der: &[u8],
        ca_der: &[u8],
    ) -> Result<(), CredentialError> {
        if !belongs_to(cert_der, key)? {
            return Err(CredentialError::Mismatch);
        }
        self.ensure_dir()?;

        let key_staged = staged_path(&self.key_path());
        let cert_staged = staged_path(&self.cert_path());
        write_file(&key_staged, key.to_pem().as_bytes(), PRIVATE_MODE)?;
        write_file(&cert_staged, encode_cert_pem(cert_der).as_bytes(), PRIVATE_MODE)?;

        rename(&key_staged, &self.key_path())?;
        rename(&cert_staged, &self.cert_path())?;

        if !ca_der.is_empty() {
            write_atomic(&self.ca_path(), encode_cert_pem(ca_der).as_bytes(), PUBLIC_MODE)?;
        }
        Ok(())
    }

    fn ensure_dir(&self) -> Result<(), CredentialError> {
        fs::create_dir_all(&self.dir).map_err(|source| CredentialError::Io {
            path: self.dir.clone(),
            source,
        })
    }
}

const PRIVATE_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;

fn belongs_to(cert_der: &[u8], key: &PrivateKey) -> Result<bool, CredentialError> {
    Ok(extract_public_key_from_cert(cert_der)? == key.public_key_raw())
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

fn read_string(path: &Path) -> Result<String, CredentialError> {
    fs::read_to_string(path).map_err(|source| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_cert(path: &Path) -> Result<Vec<u8>, CredentialError> {
    decode_cert_pem(&read_string(path)?).map_err(|source| CredentialError::Pem {
        path: path.to_path_buf(),
        source,
    })
}

fn rename(from: &Path, to: &Path) -> Result<(), CredentialError> {
    fs::rename(from, to).map_err(|source| CredentialError::Io {
        path: to.to_path_buf(),
        source,
    })
}

/// Write `contents` to `path` and fsync it.
fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), CredentialError> {
    let io_err = |source| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    // `mode` only applies on create; tighten files that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err)?;
    }
    Ok(())
}

/// Stage `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), CredentialError> {
    let staged = staged_path(path);
    write_file(&staged, contents, mode)?;
    rename(&staged, path)
}

pub(crate) const STATE_MODE: u32 = PRIVATE_MODE;
