//! Persistent enrollment-token registry backed by SQLite.
//!
//! Only the SHA-256 of each secret is stored. Consumption is a single
//! conditional UPDATE so concurrent enrollments cannot both spend the last
//! use of a token.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_auth::{generate_token_secret, hash_token};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::from_unix;

/// Default lifetime of a token created without an explicit expiry.
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Stored view of an enrollment token. Never contains the raw secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentToken {
    pub id: String,
    pub token_hash: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    /// First agent that consumed this token.
    pub agent_id: Option<String>,
    pub max_uses: i64,
    pub use_count: i64,
}

impl EnrollmentToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    pub fn is_exhausted(&self) -> bool {
        self.use_count >= self.max_uses
    }

    fn check(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if self.is_expired(now) {
            return Err(TokenError::Expired);
        }
        if self.is_exhausted() {
            return Err(TokenError::Exhausted);
        }
        Ok(())
    }
}

/// A freshly created token. `token` is the raw secret, shown exactly once.
#[derive(Debug, Clone)]
pub struct CreatedToken {
    pub id: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: i64,
}

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("enrollment token not found")]
    NotFound,
    #[error("enrollment token expired")]
    Expired,
    #[error("enrollment token has no uses left")]
    Exhausted,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Registry of enrollment tokens.
#[derive(Clone)]
pub struct TokenRegistry {
    pool: SqlitePool,
    default_expiry: Duration,
}

impl TokenRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            default_expiry: DEFAULT_TOKEN_EXPIRY,
        }
    }

    /// Override the expiry applied when `create_token` gets `None`.
    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    /// Create a token and return its raw secret.
    ///
    /// `max_uses <= 0` is treated as 1. `expires_in = None` applies the
    /// registry default.
    pub async fn create_token(
        &self,
        description: &str,
        max_uses: i64,
        expires_in: Option<Duration>,
    ) -> Result<CreatedToken, TokenError> {
        let id = Uuid::new_v4().to_string();
        let secret = generate_token_secret();
        let max_uses = max_uses.max(1);
        let now = current_timestamp();

        let expires_in = expires_in.unwrap_or(self.default_expiry);
        let expires_at = now.saturating_add(i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX));

        sqlx::query(
            r#"
            INSERT INTO enrollment_tokens (id, token_hash, description, created_at, expires_at, max_uses)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(hash_token(&secret))
        .bind(description)
        .bind(now)
        .bind(expires_at)
        .bind(max_uses)
        .execute(&self.pool)
        .await?;

        tracing::info!(token_id = %id, max_uses, expires_at, "Enrollment token created");

        Ok(CreatedToken {
            id,
            token: secret,
            expires_at: DateTime::from_timestamp(expires_at, 0),
            max_uses,
        })
    }

    /// Look up a token by hash and check it is still usable. Read-only.
    pub async fn validate_token(&self, token_hash: &str) -> Result<EnrollmentToken, TokenError> {
        let token = self
            .find_by_hash(token_hash)
            .await?
            .ok_or(TokenError::NotFound)?;
        token.check(Utc::now())?;
        Ok(token)
    }

    /// Spend one use of the token, binding `agent_id` on first use.
    pub async fn consume_token(&self, token_hash: &str, agent_id: &str) -> Result<(), TokenError> {
        let mut conn = self.pool.acquire().await?;
        consume_token_on(&mut *conn, token_hash, agent_id).await
    }

    pub async fn list_tokens(&self) -> Result<Vec<EnrollmentToken>, TokenError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM enrollment_tokens ORDER BY created_at DESC, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| parse_token_row(row).map_err(TokenError::from))
            .collect()
    }

    pub async fn get_token(&self, id: &str) -> Result<Option<EnrollmentToken>, TokenError> {
        let row = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM enrollment_tokens WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(parse_token_row).transpose()?)
    }

    /// Delete a token by id.
    pub async fn delete_token(&self, id: &str) -> Result<(), TokenError> {
        let result = sqlx::query("DELETE FROM enrollment_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TokenError::NotFound);
        }
        tracing::info!(token_id = %id, "Enrollment token deleted");
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<EnrollmentToken>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        find_by_hash_on(&mut *conn, token_hash).await
    }
}

/// Consume a token on an existing connection or transaction.
///
/// Zero affected rows means the token is unknown, expired or out of uses;
/// the row is re-read only to report which.
pub async fn consume_token_on(
    conn: &mut SqliteConnection,
    token_hash: &str,
    agent_id: &str,
) -> Result<(), TokenError> {
    let now = current_timestamp();

    let result = sqlx::query(
        "UPDATE enrollment_tokens
         SET use_count = use_count + 1,
             used_at = COALESCE(used_at, ?),
             agent_id = COALESCE(agent_id, ?)
         WHERE token_hash = ?
           AND use_count < max_uses
           AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(now)
    .bind(agent_id)
    .bind(token_hash)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let token = find_by_hash_on(&mut *conn, token_hash)
            .await?
            .ok_or(TokenError::NotFound)?;
        return Err(if token.is_expired(Utc::now()) {
            TokenError::Expired
        } else {
            TokenError::Exhausted
        });
    }

    Ok(())
}

const TOKEN_COLUMNS: &str =
    "id, token_hash, description, created_at, expires_at, used_at, agent_id, max_uses, use_count";

async fn find_by_hash_on(
    conn: &mut SqliteConnection,
    token_hash: &str,
) -> Result<Option<EnrollmentToken>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {TOKEN_COLUMNS} FROM enrollment_tokens WHERE token_hash = ?"
    ))
    .bind(token_hash)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(parse_token_row).transpose()
}

fn parse_token_row(row: &SqliteRow) -> Result<EnrollmentToken, sqlx::Error> {
    Ok(EnrollmentToken {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        description: row.try_get("description")?,
        created_at: from_unix("created_at", row.try_get("created_at")?)?,
        expires_at: row
            .try_get::<Option<i64>, _>("expires_at")?
            .map(|secs| from_unix("expires_at", secs))
            .transpose()?,
        used_at: row
            .try_get::<Option<i64>, _>("used_at")?
            .map(|secs| from_unix("used_at", secs))
            .transpose()?,
        agent_id: row.try_get("agent_id")?,
        max_uses: row.try_get("max_uses")?,
        use_count: row.try_get("use_count")?,
    })
}

fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}
