//! Enrollment tokens.
//!
//! Provides [`TokenRegistry`]: persistent storage for hashed, expiring,
//! usage-limited bootstrap secrets.

mod store;

pub use fleet_auth::hash_token;
pub use store::{
    consume_token_on, CreatedToken, EnrollmentToken, TokenError, TokenRegistry,
    DEFAULT_TOKEN_EXPIRY,
};
