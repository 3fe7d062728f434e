//! Check-in protocol handler.
//!
//! A single check-in call carries enrollment, heartbeat and certificate
//! renewal. Each call runs, in order:
//!
//! 1. version gate (rejected versions short-circuit in-band)
//! 2. branch selection: enroll when only a token is given, heartbeat otherwise
//! 3. enrollment
//! 4. peer identity binding
//! 5. renewal when a CSR accompanies a heartbeat
//! 6. heartbeat bookkeeping
//! 7. response assembly
//!
//! The handler is transport-agnostic: the verified peer subject, if any, is
//! passed in by the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_auth::{hash_token, CertificateAuthority, SignedCertificate};
use fleet_proto::{Ack, CheckInRequest, CheckInResponse, ProfileReport, VersionStatus, PROTO_VERSION};
use uuid::Uuid;

use crate::auth::{consume_token_on, TokenError, TokenRegistry};
use crate::directory::{upsert_agent_on, Agent, AgentDirectory, AgentStatus, DirectoryError};
use crate::events::{EventBus, FleetEvent};

/// Immutable per-process settings of the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Build version reported back to agents.
    pub server_version: String,
    /// Protocol version this server speaks; one below is still accepted.
    pub proto_version: u32,
    /// Recommended interval between check-ins.
    pub check_interval: Duration,
    /// Validity of renewed certificates; zero uses the CA default.
    pub renewal_validity: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            proto_version: PROTO_VERSION,
            check_interval: Duration::from_secs(30),
            renewal_validity: Duration::ZERO,
        }
    }
}

/// Errors that abort a check-in or profile report.
#[derive(Debug, thiserror::Error)]
pub enum CheckInError {
    #[error("agent_id is required for check-in (use enroll_token for initial enrollment)")]
    MissingIdentity,

    #[error("invalid enrollment token: {0}")]
    InvalidToken(TokenError),

    #[error("invalid certificate request: {0}")]
    InvalidCsr(String),

    #[error("agent_id {claimed:?} does not match client certificate CN {peer:?}")]
    IdentityMismatch { claimed: String, peer: String },

    #[error("{0}")]
    InvalidArgument(&'static str),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<TokenError> for CheckInError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Database(e) => Self::Storage(e.to_string()),
            other => Self::InvalidToken(other),
        }
    }
}

impl From<DirectoryError> for CheckInError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::AgentNotFound(id) => Self::AgentNotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for CheckInError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Server side of the check-in protocol.
#[derive(Clone)]
pub struct CheckInHandler {
    ca: Arc<CertificateAuthority>,
    tokens: TokenRegistry,
    directory: AgentDirectory,
    events: EventBus,
    config: HandlerConfig,
}

/// Outcome of a successful enrollment.
struct Enrollment {
    agent_id: String,
    certificate: Option<SignedCertificate>,
}

impl CheckInHandler {
    /// `tokens` and `directory` must share one pool so enrollment can run in
    /// a single transaction.
    pub fn new(
        ca: Arc<CertificateAuthority>,
        tokens: TokenRegistry,
        directory: AgentDirectory,
        events: EventBus,
        config: HandlerConfig,
    ) -> Self {
        Self {
            ca,
            tokens,
            directory,
            events,
            config,
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Classify a protocol version against the one this server speaks.
    pub fn version_status(&self, proto_version: u32) -> VersionStatus {
        if proto_version == self.config.proto_version {
            VersionStatus::Ok
        } else if proto_version.checked_add(1) == Some(self.config.proto_version) {
            VersionStatus::Deprecated
        } else {
            VersionStatus::Rejected
        }
    }

    /// Process one check-in.
    ///
    /// `peer_subject` is the common name of the verified client certificate
    /// on the connection, when there is one.
    pub async fn handle_check_in(
        &self,
        req: &CheckInRequest,
        peer_subject: Option<&str>,
    ) -> Result<CheckInResponse, CheckInError> {
        let version_status = self.version_status(req.proto_version);
        if version_status == VersionStatus::Rejected {
            tracing::info!(
                agent_id = %req.agent_id,
                proto_version = req.proto_version,
                "Rejected check-in from unsupported protocol version"
            );
            return Ok(CheckInResponse {
                acknowledged: false,
                version_status: version_status.into(),
                server_version: self.config.server_version.clone(),
                upgrade_message: format!(
                    "proto version {} is not supported; server requires version {}",
                    req.proto_version, self.config.proto_version
                ),
                ..Default::default()
            });
        }

        let mut agent_id = req.agent_id.clone();
        let mut assigned_agent_id = String::new();
        let mut certificate = None;

        if agent_id.is_empty() {
            if req.enroll_token.is_empty() {
                return Err(CheckInError::MissingIdentity);
            }
            let enrollment = self.enroll(req).await?;
            agent_id = enrollment.agent_id.clone();
            assigned_agent_id = enrollment.agent_id;
            certificate = enrollment.certificate;
        }
        let enrolled = !assigned_agent_id.is_empty();

        if !enrolled {
            if let Some(peer) = peer_subject {
                if peer != agent_id {
                    tracing::warn!(agent_id = %agent_id, cert_cn = %peer, "agent_id mismatch with client certificate");
                    return Err(CheckInError::IdentityMismatch {
                        claimed: agent_id,
                        peer: peer.to_string(),
                    });
                }
                tracing::debug!(agent_id = %agent_id, "Client certificate identity verified");
            }
        }

        if !enrolled && !req.certificate_request.is_empty() {
            certificate = self.renew(&agent_id, &req.certificate_request).await;
        }

        if let Err(e) = self
            .directory
            .update_check_in(
                &agent_id,
                &req.hostname,
                &req.platform,
                &req.agent_version,
                req.proto_version,
            )
            .await
        {
            tracing::warn!(agent_id = %agent_id, error = %e, "Check-in update failed");
        }

        if let Some(metrics) = &req.metrics {
            tracing::debug!(
                agent_id = %agent_id,
                cpu_percent = metrics.cpu_percent,
                memory_percent = metrics.memory_percent,
                disk_percent = metrics.disk_percent,
                "Received agent metrics"
            );
        }
        self.events.publish(FleetEvent::AgentCheckIn {
            agent_id: agent_id.clone(),
            hostname: req.hostname.clone(),
            platform: req.platform.clone(),
            cpu_percent: req.metrics.as_ref().map(|m| m.cpu_percent),
            memory_percent: req.metrics.as_ref().map(|m| m.memory_percent),
        });

        let (signed_certificate, ca_certificate) = match certificate {
            Some(cert) => (cert.der, self.ca.root_cert_der().to_vec()),
            None => (Vec::new(), Vec::new()),
        };

        Ok(CheckInResponse {
            acknowledged: true,
            check_interval_seconds: i32::try_from(self.config.check_interval.as_secs())
                .unwrap_or(i32::MAX),
            version_status: version_status.into(),
            server_version: self.config.server_version.clone(),
            upgrade_message: String::new(),
            assigned_agent_id,
            signed_certificate,
            ca_certificate,
        })
    }

    /// Create a new agent from a token-bearing request.
    ///
    /// Token consumption and the agent insert commit together or not at
    /// all; the enrolled event is only published after commit.
    async fn enroll(&self, req: &CheckInRequest) -> Result<Enrollment, CheckInError> {
        let token_hash = hash_token(&req.enroll_token);
        if let Err(e) = self.tokens.validate_token(&token_hash).await {
            tracing::warn!(hostname = %req.hostname, error = %e, "Enrollment rejected");
            return Err(e.into());
        }

        let agent_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let certificate = if req.certificate_request.is_empty() {
            None
        } else {
            let cert = self
                .ca
                .sign_csr(&req.certificate_request, &agent_id, Duration::ZERO)
                .map_err(|e| CheckInError::InvalidCsr(e.to_string()))?;
            log_signed(&agent_id, &cert);
            Some(cert)
        };

        let agent = Agent {
            id: agent_id.clone(),
            hostname: req.hostname.clone(),
            platform: req.platform.clone(),
            agent_version: req.agent_version.clone(),
            proto_version: req.proto_version,
            device_id: String::new(),
            status: AgentStatus::Connected,
            last_check_in: Some(now),
            enrolled_at: now,
            cert_serial: certificate
                .as_ref()
                .map(|c| c.serial_hex.clone())
                .unwrap_or_default(),
            cert_expires_at: certificate.as_ref().and_then(|c| to_chrono(c.expires_at)),
            config_json: "{}".to_string(),
        };

        let mut tx = self.directory.begin().await?;
        if let Err(e) = consume_token_on(&mut *tx, &token_hash, &agent_id).await {
            // dropping the transaction rolls back
            tracing::warn!(hostname = %req.hostname, error = %e, "Enrollment token consumption failed");
            return Err(e.into());
        }
        upsert_agent_on(&mut *tx, &agent).await?;
        tx.commit().await?;

        tracing::info!(
            agent_id = %agent_id,
            hostname = %agent.hostname,
            platform = %agent.platform,
            with_certificate = certificate.is_some(),
            "Agent enrolled"
        );
        self.events.publish(FleetEvent::AgentEnrolled {
            agent_id: agent_id.clone(),
            hostname: agent.hostname,
            platform: agent.platform,
        });

        Ok(Enrollment {
            agent_id,
            certificate,
        })
    }

    /// Sign a renewal CSR for an existing agent.
    ///
    /// Never fails the call: problems are logged and the agent retries on a
    /// later check-in.
    async fn renew(&self, agent_id: &str, csr_der: &[u8]) -> Option<SignedCertificate> {
        match self.directory.get_agent(agent_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(agent_id = %agent_id, "Renewal requested for unknown agent");
                return None;
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Renewal lookup failed");
                return None;
            }
        }

        let cert = match self
            .ca
            .sign_csr(csr_der, agent_id, self.config.renewal_validity)
        {
            Ok(cert) => cert,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Failed to sign renewal CSR");
                return None;
            }
        };
        log_signed(agent_id, &cert);

        match to_chrono(cert.expires_at) {
            Some(expires_at) => {
                if let Err(e) = self
                    .directory
                    .update_agent_cert(agent_id, &cert.serial_hex, expires_at)
                    .await
                {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Failed to update agent cert fields");
                }
            }
            None => tracing::warn!(agent_id = %agent_id, "Certificate expiry out of range"),
        }

        tracing::info!(agent_id = %agent_id, cert_serial = %cert.serial_hex, "Renewed agent certificate");
        Some(cert)
    }

    /// Store a hardware/software/service snapshot for an agent.
    pub async fn report_profile(&self, req: &ProfileReport) -> Result<Ack, CheckInError> {
        if req.agent_id.is_empty() {
            return Err(CheckInError::InvalidArgument("agent_id is required"));
        }
        let Some(profile) = &req.profile else {
            return Err(CheckInError::InvalidArgument("profile is required"));
        };

        self.directory.upsert_profile(&req.agent_id, profile).await?;

        let hardware = profile.hardware.clone().unwrap_or_default();
        let software = profile.software.clone().unwrap_or_default();
        tracing::info!(
            agent_id = %req.agent_id,
            cpu_model = %hardware.cpu_model,
            os_name = %software.os_name,
            services = profile.services.len(),
            "Device profile stored"
        );
        self.events.publish(FleetEvent::DeviceProfiled {
            agent_id: req.agent_id.clone(),
            cpu_model: hardware.cpu_model,
            os_name: software.os_name,
        });

        Ok(Ack {
            success: true,
            message: String::new(),
        })
    }
}

fn log_signed(agent_id: &str, cert: &SignedCertificate) {
    tracing::info!(
        subject = %agent_id,
        serial = %cert.serial_hex,
        expires_at = %cert.expires_at,
        "signed agent certificate"
    );
}

fn to_chrono(ts: time::OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.unix_timestamp(), ts.nanosecond())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use fleet_auth::{generate_key_and_csr, parse_certificate, verify_issued_by, AuthorityConfig};
    use fleet_proto::{HardwareProfile, SystemMetrics, SystemProfile};

    struct Fixture {
        handler: CheckInHandler,
        tokens: TokenRegistry,
        directory: AgentDirectory,
        events: EventBus,
        ca: Arc<CertificateAuthority>,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let ca = Arc::new(CertificateAuthority::generate(AuthorityConfig::default()).unwrap());
        let tokens = TokenRegistry::new(db.pool().clone());
        let directory = AgentDirectory::new(db.pool().clone());
        let events = EventBus::new();
        let handler = CheckInHandler::new(
            ca.clone(),
            tokens.clone(),
            directory.clone(),
            events.clone(),
            HandlerConfig {
                server_version: "9.9.9".to_string(),
                ..HandlerConfig::default()
            },
        );
        Fixture {
            handler,
            tokens,
            directory,
            events,
            ca,
        }
    }

    fn request() -> CheckInRequest {
        CheckInRequest {
            hostname: "web-01".to_string(),
            platform: "linux/amd64".to_string(),
            agent_version: "0.3.0".to_string(),
            proto_version: PROTO_VERSION,
            ..Default::default()
        }
    }

    async fn enroll(f: &Fixture) -> String {
        let token = f.tokens.create_token("", 1, None).await.unwrap();
        let req = CheckInRequest {
            enroll_token: token.token,
            ..request()
        };
        f.handler
            .handle_check_in(&req, None)
            .await
            .unwrap()
            .assigned_agent_id
    }

    #[tokio::test]
    async fn test_version_gate() {
        let f = fixture().await;
        assert_eq!(f.handler.version_status(PROTO_VERSION), VersionStatus::Ok);
        assert_eq!(
            f.handler.version_status(PROTO_VERSION - 1),
            VersionStatus::Deprecated
        );
        assert_eq!(
            f.handler.version_status(PROTO_VERSION + 1),
            VersionStatus::Rejected
        );

        // rejected short-circuits: not even a missing identity is reported
        let req = CheckInRequest {
            proto_version: PROTO_VERSION + 5,
            ..Default::default()
        };
        let resp = f.handler.handle_check_in(&req, None).await.unwrap();
        assert!(!resp.acknowledged);
        assert_eq!(resp.version_status(), VersionStatus::Rejected);
        assert_eq!(resp.server_version, "9.9.9");
        assert_eq!(
            resp.upgrade_message,
            format!(
                "proto version {} is not supported; server requires version {}",
                PROTO_VERSION + 5,
                PROTO_VERSION
            )
        );
    }

    #[tokio::test]
    async fn test_rejected_version_does_no_token_work() {
        let f = fixture().await;
        let token = f.tokens.create_token("", 1, None).await.unwrap();
        let req = CheckInRequest {
            proto_version: PROTO_VERSION + 1,
            enroll_token: token.token.clone(),
            ..request()
        };
        f.handler.handle_check_in(&req, None).await.unwrap();

        let stored = f.tokens.get_token(&token.id).await.unwrap().unwrap();
        assert_eq!(stored.use_count, 0);
        assert!(f.directory.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_identity() {
        let f = fixture().await;
        let result = f.handler.handle_check_in(&request(), None).await;
        assert!(matches!(result, Err(CheckInError::MissingIdentity)));
    }

    #[tokio::test]
    async fn test_enroll_without_csr() {
        let f = fixture().await;
        let mut rx = f.events.subscribe();
        let id = enroll(&f).await;
        assert!(!id.is_empty());

        let agent = f.directory.get_agent(&id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Connected);
        assert_eq!(agent.hostname, "web-01");
        assert!(agent.cert_serial.is_empty());
        assert_eq!(agent.config_json, "{}");

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            FleetEvent::AgentEnrolled {
                agent_id: id.clone(),
                hostname: "web-01".to_string(),
                platform: "linux/amd64".to_string(),
            }
        );
        assert!(matches!(rx.recv().await.unwrap(), FleetEvent::AgentCheckIn { .. }));
    }

    #[tokio::test]
    async fn test_enroll_with_csr_returns_chain() {
        let f = fixture().await;
        let token = f.tokens.create_token("", 1, None).await.unwrap();
        let (_key, csr) = generate_key_and_csr("pending", "web-01").unwrap();
        let req = CheckInRequest {
            enroll_token: token.token,
            certificate_request: csr,
            ..request()
        };

        let resp = f.handler.handle_check_in(&req, None).await.unwrap();
        assert!(resp.acknowledged);
        assert_eq!(resp.version_status(), VersionStatus::Ok);
        assert_eq!(resp.ca_certificate, f.ca.root_cert_der());
        verify_issued_by(&resp.signed_certificate, &resp.ca_certificate).unwrap();

        let info = parse_certificate(&resp.signed_certificate).unwrap();
        assert_eq!(info.subject_cn, resp.assigned_agent_id);

        let agent = f
            .directory
            .get_agent(&resp.assigned_agent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.cert_serial, info.serial_hex);
        assert!(agent.cert_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_token_creates_nothing() {
        let f = fixture().await;
        let req = CheckInRequest {
            enroll_token: "not-a-real-token".to_string(),
            ..request()
        };
        let result = f.handler.handle_check_in(&req, None).await;
        assert!(matches!(
            result,
            Err(CheckInError::InvalidToken(TokenError::NotFound))
        ));
        assert!(f.directory.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_csr_on_enroll_leaves_token_unspent() {
        let f = fixture().await;
        let token = f.tokens.create_token("", 1, None).await.unwrap();
        let req = CheckInRequest {
            enroll_token: token.token.clone(),
            certificate_request: b"garbage".to_vec(),
            ..request()
        };

        let result = f.handler.handle_check_in(&req, None).await;
        assert!(matches!(result, Err(CheckInError::InvalidCsr(_))));

        let stored = f.tokens.get_token(&token.id).await.unwrap().unwrap();
        assert_eq!(stored.use_count, 0);
        assert!(f.directory.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_reuse_is_exhausted() {
        let f = fixture().await;
        let token = f.tokens.create_token("", 1, None).await.unwrap();
        let req = CheckInRequest {
            enroll_token: token.token,
            ..request()
        };

        f.handler.handle_check_in(&req, None).await.unwrap();
        let result = f.handler.handle_check_in(&req, None).await;
        assert!(matches!(
            result,
            Err(CheckInError::InvalidToken(TokenError::Exhausted))
        ));
        assert_eq!(f.directory.list_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_identity_must_match() {
        let f = fixture().await;
        let id = enroll(&f).await;
        let req = CheckInRequest {
            agent_id: id.clone(),
            ..request()
        };

        let result = f.handler.handle_check_in(&req, Some("other")).await;
        assert!(matches!(result, Err(CheckInError::IdentityMismatch { .. })));

        let resp = f.handler.handle_check_in(&req, Some(&id)).await.unwrap();
        assert!(resp.acknowledged);
        assert!(resp.assigned_agent_id.is_empty());
    }

    #[tokio::test]
    async fn test_peer_identity_ignored_on_fresh_enrollment() {
        let f = fixture().await;
        let token = f.tokens.create_token("", 1, None).await.unwrap();
        let req = CheckInRequest {
            enroll_token: token.token,
            ..request()
        };
        let resp = f
            .handler
            .handle_check_in(&req, Some("previous-identity"))
            .await
            .unwrap();
        assert!(!resp.assigned_agent_id.is_empty());
    }

    #[tokio::test]
    async fn test_renewal_advances_expiry() {
        let f = fixture().await;
        let id = enroll(&f).await;
        let old_expiry = Utc::now() + chrono::Duration::days(1);
        f.directory
            .update_agent_cert(&id, "01", old_expiry)
            .await
            .unwrap();

        let (_key, csr) = generate_key_and_csr(&id, "web-01").unwrap();
        let req = CheckInRequest {
            agent_id: id.clone(),
            certificate_request: csr,
            ..request()
        };
        let resp = f.handler.handle_check_in(&req, Some(&id)).await.unwrap();

        assert!(resp.assigned_agent_id.is_empty());
        assert!(!resp.signed_certificate.is_empty());
        assert_eq!(resp.ca_certificate, f.ca.root_cert_der());

        let agent = f.directory.get_agent(&id).await.unwrap().unwrap();
        assert_ne!(agent.cert_serial, "01");
        assert!(agent.cert_expires_at.unwrap() > old_expiry);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_heartbeat() {
        let f = fixture().await;
        let id = enroll(&f).await;
        let req = CheckInRequest {
            agent_id: id.clone(),
            certificate_request: b"garbage".to_vec(),
            ..request()
        };

        let resp = f.handler.handle_check_in(&req, None).await.unwrap();
        assert!(resp.acknowledged);
        assert!(resp.signed_certificate.is_empty());
        assert!(resp.ca_certificate.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent_heartbeat_is_soft() {
        let f = fixture().await;
        let (_key, csr) = generate_key_and_csr("ghost", "web-01").unwrap();
        let req = CheckInRequest {
            agent_id: "ghost".to_string(),
            certificate_request: csr,
            ..request()
        };

        let resp = f.handler.handle_check_in(&req, None).await.unwrap();
        assert!(resp.acknowledged);
        // no certificate for an identity that was never enrolled
        assert!(resp.signed_certificate.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_reach_checkin_event() {
        let f = fixture().await;
        let id = enroll(&f).await;
        let mut rx = f.events.subscribe();

        let req = CheckInRequest {
            agent_id: id.clone(),
            metrics: Some(SystemMetrics {
                cpu_percent: 42.0,
                memory_percent: 61.5,
                ..Default::default()
            }),
            ..request()
        };
        f.handler.handle_check_in(&req, None).await.unwrap();

        match rx.recv().await.unwrap() {
            FleetEvent::AgentCheckIn {
                agent_id,
                cpu_percent,
                memory_percent,
                ..
            } => {
                assert_eq!(agent_id, id);
                assert_eq!(cpu_percent, Some(42.0));
                assert_eq!(memory_percent, Some(61.5));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deprecated_version_is_processed() {
        let f = fixture().await;
        let id = enroll(&f).await;
        let req = CheckInRequest {
            agent_id: id,
            proto_version: PROTO_VERSION - 1,
            ..request()
        };
        let resp = f.handler.handle_check_in(&req, None).await.unwrap();
        assert!(resp.acknowledged);
        assert_eq!(resp.version_status(), VersionStatus::Deprecated);
        assert_eq!(resp.check_interval_seconds, 30);
    }

    #[tokio::test]
    async fn test_report_profile() {
        let f = fixture().await;
        let id = enroll(&f).await;

        let missing_id = ProfileReport {
            agent_id: String::new(),
            profile: Some(SystemProfile::default()),
        };
        assert!(matches!(
            f.handler.report_profile(&missing_id).await,
            Err(CheckInError::InvalidArgument(_))
        ));

        let missing_profile = ProfileReport {
            agent_id: id.clone(),
            profile: None,
        };
        assert!(matches!(
            f.handler.report_profile(&missing_profile).await,
            Err(CheckInError::InvalidArgument(_))
        ));

        let report = ProfileReport {
            agent_id: id.clone(),
            profile: Some(SystemProfile {
                hardware: Some(HardwareProfile {
                    cpu_model: "Xeon".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };
        let ack = f.handler.report_profile(&report).await.unwrap();
        assert!(ack.success);

        let stored = f.directory.get_profile(&id).await.unwrap().unwrap();
        assert_eq!(stored.hardware.cpu_model, "Xeon");
    }

    #[tokio::test]
    async fn test_report_profile_unknown_agent() {
        let f = fixture().await;
        let report = ProfileReport {
            agent_id: "ghost".to_string(),
            profile: Some(SystemProfile::default()),
        };
        assert!(matches!(
            f.handler.report_profile(&report).await,
            Err(CheckInError::AgentNotFound(_))
        ));
    }
}
