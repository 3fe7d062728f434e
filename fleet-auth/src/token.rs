//! Enrollment token secrets.
//!
//! The raw secret is handed to an operator exactly once. Only its SHA-256
//! digest is ever persisted or compared.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Number of random bytes in a token secret.
pub const TOKEN_SECRET_BYTES: usize = 32;

/// Generate a new random token secret, hex encoded (64 chars).
pub fn generate_token_secret() -> String {
    // OsRng directly, never ThreadRng, for bootstrap credentials
    let mut random = [0u8; TOKEN_SECRET_BYTES];
    OsRng.fill_bytes(&mut random);
    hex::encode(random)
}

/// Hash a token for storage (never store the raw token).
///
/// Surrounding whitespace is ignored so secrets pasted from a terminal
/// still match.
pub fn hash_token(token: &str) -> String {
    let hash = Sha256::digest(token.trim().as_bytes());
    hex::encode(hash)
}
