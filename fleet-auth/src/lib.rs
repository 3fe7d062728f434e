//! Pure PKI library for the fleet.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! Callers own persistence. The daemon decides where the root key lives and
//! the agent decides where its leaf credentials live; this crate only turns
//! bytes into certificates and back.
//!
//! # Example
//!
//! ```
//! use fleet_auth::{AuthorityConfig, CertificateAuthority, generate_key_and_csr};
//! use std::time::Duration;
//!
//! let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
//! let (_key, csr) = generate_key_and_csr("pending", "host-01").unwrap();
//! let leaf = ca.sign_csr(&csr, "agent-123", Duration::ZERO).unwrap();
//! assert!(!leaf.serial_hex.is_empty());
//! ```

pub mod authority;
pub mod cert;
pub mod csr;
pub mod encoding;
pub mod keys;
pub mod token;

pub use authority::{AuthorityConfig, AuthorityError, CertificateAuthority, SignedCertificate};
pub use cert::{
    extract_public_key_from_cert, is_expiring_soon, parse_certificate, verify_issued_by,
    CertError, CertificateInfo,
};
pub use csr::{create_csr, generate_key_and_csr, CsrError};
pub use keys::{KeyError, PrivateKey};
pub use encoding::{
    decode_cert_pem, decode_key_pem, encode_cert_pem, encode_key_pem, PemError,
};
pub use token::{generate_token_secret, hash_token};
