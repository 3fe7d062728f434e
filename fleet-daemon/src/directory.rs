//! Agent directory: one persisted record per enrolled agent, plus the most
//! recent device profile each agent reported.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_proto::{HardwareProfile, ServiceInfo, SoftwareInventory, SystemProfile};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::db::{format_timestamp, parse_timestamp};

/// Connectivity state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Connected,
    Disconnected,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(format!("unknown agent status: {}", other)),
        }
    }
}

/// A known agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    /// Server-assigned id. Never changes once set.
    pub id: String,
    pub hostname: String,
    /// `os/arch`, e.g. `linux/amd64`.
    pub platform: String,
    pub agent_version: String,
    pub proto_version: u32,
    pub device_id: String,
    pub status: AgentStatus,
    pub last_check_in: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    /// Hex serial of the most recently issued leaf, empty if none.
    pub cert_serial: String,
    pub cert_expires_at: Option<DateTime<Utc>>,
    pub config_json: String,
}

/// Latest hardware/software/service snapshot of an agent's host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub agent_id: String,
    pub hardware: HardwareProfile,
    pub software: SoftwareInventory,
    pub services: Vec<ServiceInfo>,
    pub collected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Errors that can occur during directory operations.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("failed to encode profile: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// SQLite-backed store of agents and their device profiles.
#[derive(Clone)]
pub struct AgentDirectory {
    pool: SqlitePool,
}

impl AgentDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Start a transaction on the directory's pool.
    ///
    /// The token registry shares the pool, so a single transaction can
    /// cover token consumption and agent creation.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Insert an agent or fully replace the record with the same id.
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), DirectoryError> {
        let mut conn = self.pool.acquire().await?;
        upsert_agent_on(&mut *conn, agent).await
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>, DirectoryError> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(parse_agent_row).transpose()?)
    }

    /// All agents, most recently enrolled first.
    pub async fn list_agents(&self) -> Result<Vec<Agent>, DirectoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY enrolled_at DESC, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| parse_agent_row(row).map_err(DirectoryError::from))
            .collect()
    }

    pub async fn delete_agent(&self, id: &str) -> Result<(), DirectoryError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::AgentNotFound(id.to_string()));
        }
        tracing::info!(agent_id = %id, "Agent deleted");
        Ok(())
    }

    /// Record a heartbeat: refresh reported fields, mark connected and
    /// stamp `last_check_in`.
    pub async fn update_check_in(
        &self,
        id: &str,
        hostname: &str,
        platform: &str,
        agent_version: &str,
        proto_version: u32,
    ) -> Result<(), DirectoryError> {
        let result = sqlx::query(
            r#"
            UPDATE agents SET
                hostname = ?2,
                platform = ?3,
                agent_version = ?4,
                proto_version = ?5,
                status = ?6,
                last_check_in = ?7
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(hostname)
        .bind(platform)
        .bind(agent_version)
        .bind(i64::from(proto_version))
        .bind(AgentStatus::Connected.as_str())
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace only the certificate metadata of an agent.
    pub async fn update_agent_cert(
        &self,
        id: &str,
        serial: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let result =
            sqlx::query("UPDATE agents SET cert_serial = ?2, cert_expires_at = ?3 WHERE id = ?1")
                .bind(id)
                .bind(serial)
                .bind(format_timestamp(expires_at))
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Mark connected agents whose last check-in is older than `timeout` as
    /// disconnected. Returns the ids that changed.
    pub async fn mark_stale_disconnected(
        &self,
        timeout: Duration,
    ) -> Result<Vec<String>, DirectoryError> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let rows = sqlx::query(
            r#"
            UPDATE agents SET status = ?1
            WHERE status = ?2 AND (last_check_in IS NULL OR last_check_in < ?3)
            RETURNING id
            "#,
        )
        .bind(AgentStatus::Disconnected.as_str())
        .bind(AgentStatus::Connected.as_str())
        .bind(format_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Device profiles
    // =========================================================================

    /// Store the latest profile for an agent. Missing sections are stored
    /// empty.
    pub async fn upsert_profile(
        &self,
        agent_id: &str,
        profile: &SystemProfile,
    ) -> Result<(), DirectoryError> {
        let hardware = serde_json::to_string(&profile.hardware.clone().unwrap_or_default())?;
        let software = serde_json::to_string(&profile.software.clone().unwrap_or_default())?;
        let services = serde_json::to_string(&profile.services)?;
        let now = format_timestamp(Utc::now());

        // The WHERE clause also disambiguates ON CONFLICT after INSERT ... SELECT.
        let result = sqlx::query(
            r#"
            INSERT INTO device_profiles (
                agent_id, hardware_json, software_json, services_json, collected_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?5
            WHERE EXISTS (SELECT 1 FROM agents WHERE id = ?1)
            ON CONFLICT(agent_id) DO UPDATE SET
                hardware_json = excluded.hardware_json,
                software_json = excluded.software_json,
                services_json = excluded.services_json,
                collected_at = excluded.collected_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id)
        .bind(hardware)
        .bind(software)
        .bind(services)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::AgentNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_profile(&self, agent_id: &str) -> Result<Option<DeviceProfile>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT agent_id, hardware_json, software_json, services_json, collected_at, updated_at
            FROM device_profiles WHERE agent_id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(parse_profile_row).transpose()
    }
}

/// Insert or fully replace an agent on an existing connection or transaction.
pub async fn upsert_agent_on(
    conn: &mut SqliteConnection,
    agent: &Agent,
) -> Result<(), DirectoryError> {
    sqlx::query(
        r#"
        INSERT INTO agents (
            id, hostname, platform, agent_version, proto_version, device_id,
            status, last_check_in, enrolled_at, cert_serial, cert_expires_at, config_json
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10, ?11, ?12
        )
        ON CONFLICT(id) DO UPDATE SET
            hostname = excluded.hostname,
            platform = excluded.platform,
            agent_version = excluded.agent_version,
            proto_version = excluded.proto_version,
            device_id = excluded.device_id,
            status = excluded.status,
            last_check_in = excluded.last_check_in,
            enrolled_at = excluded.enrolled_at,
            cert_serial = excluded.cert_serial,
            cert_expires_at = excluded.cert_expires_at,
            config_json = excluded.config_json
        "#,
    )
    .bind(&agent.id)
    .bind(&agent.hostname)
    .bind(&agent.platform)
    .bind(&agent.agent_version)
    .bind(i64::from(agent.proto_version))
    .bind(&agent.device_id)
    .bind(agent.status.as_str())
    .bind(agent.last_check_in.map(format_timestamp))
    .bind(format_timestamp(agent.enrolled_at))
    .bind(&agent.cert_serial)
    .bind(agent.cert_expires_at.map(format_timestamp))
    .bind(&agent.config_json)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

const AGENT_COLUMNS: &str = "id, hostname, platform, agent_version, proto_version, device_id, \
     status, last_check_in, enrolled_at, cert_serial, cert_expires_at, config_json";

fn parse_agent_row(row: &SqliteRow) -> Result<Agent, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<AgentStatus>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    let proto_version: i64 = row.try_get("proto_version")?;
    let proto_version = u32::try_from(proto_version)
        .map_err(|e| sqlx::Error::Decode(format!("Invalid proto_version: {}", e).into()))?;

    let enrolled_at: String = row.try_get("enrolled_at")?;

    Ok(Agent {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        platform: row.try_get("platform")?,
        agent_version: row.try_get("agent_version")?,
        proto_version,
        device_id: row.try_get("device_id")?,
        status,
        last_check_in: row
            .try_get::<Option<String>, _>("last_check_in")?
            .map(|s| parse_timestamp("last_check_in", &s))
            .transpose()?,
        enrolled_at: parse_timestamp("enrolled_at", &enrolled_at)?,
        cert_serial: row.try_get("cert_serial")?,
        cert_expires_at: row
            .try_get::<Option<String>, _>("cert_expires_at")?
            .map(|s| parse_timestamp("cert_expires_at", &s))
            .transpose()?,
        config_json: row.try_get("config_json")?,
    })
}

fn parse_profile_row(row: &SqliteRow) -> Result<DeviceProfile, DirectoryError> {
    let hardware: String = row.try_get("hardware_json")?;
    let software: String = row.try_get("software_json")?;
    let services: String = row.try_get("services_json")?;
    let collected_at: String = row.try_get("collected_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DeviceProfile {
        agent_id: row.try_get("agent_id")?,
        hardware: serde_json::from_str(&hardware)?,
        software: serde_json::from_str(&software)?,
        services: serde_json::from_str(&services)?,
        collected_at: parse_timestamp("collected_at", &collected_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
