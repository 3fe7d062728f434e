//! Agent control loop and credential lifecycle.
//!
//! [`Agent::run`] connects with backoff, enrolls when there is no identity
//! yet, then multiplexes shutdown, the heartbeat timer and the profile
//! timer. Certificates close to expiry are renewed on a regular heartbeat.

use std::future::Future;
use std::time::Duration;

use fleet_auth::{generate_key_and_csr, is_expiring_soon, PrivateKey};
use fleet_proto::fleet_service_client::FleetServiceClient;
use fleet_proto::{
    Ack, CheckInRequest, CheckInResponse, ProfileReport, SystemMetrics, VersionStatus,
    PROTO_VERSION,
};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::config::AgentConfig;
use crate::credentials::CredentialStore;
use crate::inspector::{self as host, SystemInspector};
use crate::state::AgentState;
use crate::transport::{self, Backoff, Connection, TransportKind};

/// Version reported in every check-in.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subject of the enrollment CSR when the host has no usable name. The
/// daemon replaces the subject with the assigned id either way.
const PENDING_SUBJECT: &str = "pending-enrollment";

/// Errors that stop the agent or fail a single call.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no agent id and no enroll_token configured")]
    NoEnrollToken,

    #[error("enrollment rejected: {0}")]
    Rejected(String),

    #[error("server did not assign an agent id")]
    NoAgentId,

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to persist agent state: {0}")]
    State(anyhow::Error),

    #[error("failed to inspect host: {0}")]
    Inspector(anyhow::Error),
}

/// A fleet agent bound to one daemon.
pub struct Agent<I> {
    config: AgentConfig,
    store: CredentialStore,
    inspector: I,
    agent_id: String,
    hostname: String,
    platform: String,
    backoff: Backoff,
}

impl<I: SystemInspector> Agent<I> {
    pub fn new(config: AgentConfig, inspector: I) -> Self {
        Self {
            store: CredentialStore::from_config(&config),
            agent_id: config.agent_id.clone(),
            hostname: host::hostname(),
            platform: host::platform(),
            backoff: Backoff::default(),
            config,
            inspector,
        }
    }

    /// Override the reported hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Fill in the agent id from the state file unless one is configured.
    pub fn load_agent_id(&mut self) {
        if !self.agent_id.is_empty() {
            return;
        }
        match AgentState::load(&self.config.state_path()) {
            Ok(state) => self.agent_id = state.agent_id,
            Err(e) => tracing::warn!(error = %e, "Failed to read agent state, treating as new"),
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AgentError> {
        self.load_agent_id();
        if self.agent_id.is_empty() && !self.has_enroll_token() {
            return Err(AgentError::NoEnrollToken);
        }

        let Some(mut conn) = self.connect(&shutdown).await else {
            return Ok(());
        };

        if self.agent_id.is_empty() {
            let obtained = self.enroll(&mut conn.client).await?;
            if obtained && conn.kind != TransportKind::Mutual {
                tracing::info!("Reconnecting with issued certificate");
                conn = match self.connect(&shutdown).await {
                    Some(conn) => conn,
                    None => return Ok(()),
                };
            }
        }

        let mut period = self.config.check_interval();
        let mut heartbeat = ticker(period);
        let profile_period = self.config.profile_interval();
        let mut profile = ticker(profile_period);

        if let Ok(resp) = self.heartbeat(&mut conn).await {
            adopt_interval(&resp, &mut period, &mut heartbeat);
        }
        self.profile(&mut conn.client).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutting down");
                    break;
                }
                _ = heartbeat.tick() => {
                    if let Ok(resp) = self.heartbeat(&mut conn).await {
                        adopt_interval(&resp, &mut period, &mut heartbeat);
                    }
                }
                _ = profile.tick() => self.profile(&mut conn.client).await,
            }
        }
        Ok(())
    }

    /// Connect with backoff. `None` if shut down first.
    pub async fn connect(&mut self, shutdown: &CancellationToken) -> Option<Connection> {
        transport::connect_with_backoff(&self.config, &self.store, &mut self.backoff, shutdown)
            .await
    }

    fn has_enroll_token(&self) -> bool {
        self.config
            .enroll_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    /// Enroll with the configured token.
    ///
    /// In secure mode the key is written before the request is sent. Returns
    /// whether a certificate was issued and stored.
    pub async fn enroll(
        &mut self,
        client: &mut FleetServiceClient<Channel>,
    ) -> Result<bool, AgentError> {
        let token = match self.config.enroll_token.as_deref() {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => return Err(AgentError::NoEnrollToken),
        };

        let certificate_request = if self.config.insecure {
            Vec::new()
        } else {
            self.enrollment_csr()
        };

        let request = CheckInRequest {
            enroll_token: token,
            certificate_request,
            ..self.base_request()
        };
        let resp = self
            .with_deadline(client.check_in(self.deadline(request)))
            .await?;

        if !resp.acknowledged {
            return Err(AgentError::Rejected(resp.upgrade_message));
        }
        if resp.assigned_agent_id.is_empty() {
            return Err(AgentError::NoAgentId);
        }

        self.agent_id = resp.assigned_agent_id;
        AgentState {
            agent_id: self.agent_id.clone(),
        }
        .save(&self.config.state_path())
        .map_err(AgentError::State)?;
        tracing::info!(agent_id = %self.agent_id, "Enrolled");

        if resp.signed_certificate.is_empty() || resp.ca_certificate.is_empty() {
            return Ok(false);
        }
        match self
            .store
            .save_certificates(&resp.signed_certificate, &resp.ca_certificate)
        {
            Ok(()) => {
                tracing::info!(dir = %self.store.dir().display(), "Stored agent certificate");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store issued certificate");
                Ok(false)
            }
        }
    }

    /// Fresh key and CSR for enrollment; the key is on disk before this
    /// returns a non-empty CSR.
    fn enrollment_csr(&self) -> Vec<u8> {
        let subject = if self.hostname.is_empty() {
            PENDING_SUBJECT
        } else {
            self.hostname.as_str()
        };
        let (key, csr) = match generate_key_and_csr(subject, &self.hostname) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to generate CSR, enrolling without certificate");
                return Vec::new();
            }
        };
        match self.store.save_key(&key) {
            Ok(()) => csr,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist key, enrolling without certificate");
                Vec::new()
            }
        }
    }

    /// Heartbeat, renewing the certificate first if it is close to expiry.
    ///
    /// A renewed pair is installed key first and the connection is
    /// re-established with it. Until then the old pair stays in use.
    pub async fn heartbeat(&mut self, conn: &mut Connection) -> Result<CheckInResponse, AgentError> {
        let renewal = self.prepare_renewal();
        let request = CheckInRequest {
            agent_id: self.agent_id.clone(),
            metrics: self.metrics(),
            certificate_request: renewal
                .as_ref()
                .map(|(_, csr)| csr.clone())
                .unwrap_or_default(),
            ..self.base_request()
        };

        let resp = match self
            .with_deadline(conn.client.check_in(self.deadline(request)))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "Check-in failed");
                return Err(e);
            }
        };

        let status = resp.version_status();
        if !status.is_accepted() {
            tracing::warn!(
                server_version = %resp.server_version,
                message = %resp.upgrade_message,
                "Check-in rejected, agent upgrade required"
            );
            return Ok(resp);
        }
        match status {
            VersionStatus::Deprecated => tracing::warn!(
                server_version = %resp.server_version,
                "Protocol version deprecated"
            ),
            _ if !resp.acknowledged => tracing::warn!("Check-in not acknowledged"),
            _ => tracing::debug!(agent_id = %self.agent_id, "Check-in acknowledged"),
        }

        if let Some((key, _)) = renewal {
            if resp.signed_certificate.is_empty() {
                tracing::warn!("Renewal requested but no certificate returned");
            } else {
                self.install_renewal(conn, &key, &resp).await;
            }
        }
        Ok(resp)
    }

    async fn install_renewal(&self, conn: &mut Connection, key: &PrivateKey, resp: &CheckInResponse) {
        if let Err(e) =
            self.store
                .install_renewal(key, &resp.signed_certificate, &resp.ca_certificate)
        {
            tracing::warn!(error = %e, "Failed to install renewed certificate, keeping current");
            return;
        }
        tracing::info!(agent_id = %self.agent_id, "Certificate renewed");

        match transport::connect(&self.config, &self.store).await {
            Ok(fresh) => *conn = fresh,
            Err(e) => tracing::warn!(error = %e, "Failed to reconnect after renewal"),
        }
    }

    /// New key and CSR when the current certificate is within the renewal
    /// threshold. Skipped without TLS or without credentials.
    fn prepare_renewal(&self) -> Option<(PrivateKey, Vec<u8>)> {
        if self.config.insecure || !self.store.has_identity() {
            return None;
        }
        let cert = match self.store.load_certificate() {
            Ok(cert) => cert,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read certificate for renewal check");
                return None;
            }
        };
        match is_expiring_soon(&cert, self.config.renewal_threshold()) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse certificate for renewal check");
                return None;
            }
        }

        match generate_key_and_csr(&self.agent_id, &self.hostname) {
            Ok(pair) => {
                tracing::info!("Certificate expiring soon, requesting renewal");
                Some(pair)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to generate renewal CSR");
                None
            }
        }
    }

    /// Send the host profile.
    pub async fn report_profile(
        &self,
        client: &mut FleetServiceClient<Channel>,
    ) -> Result<Ack, AgentError> {
        let profile = self
            .inspector
            .collect_profile()
            .map_err(AgentError::Inspector)?;
        let report = ProfileReport {
            agent_id: self.agent_id.clone(),
            profile: Some(profile),
        };
        self.with_deadline(client.report_profile(self.deadline(report)))
            .await
    }

    async fn profile(&self, client: &mut FleetServiceClient<Channel>) {
        match self.report_profile(client).await {
            Ok(_) => tracing::info!(agent_id = %self.agent_id, "Profile reported"),
            Err(e) => tracing::warn!(error = %e, "Failed to report profile"),
        }
    }

    fn metrics(&self) -> Option<SystemMetrics> {
        match self.inspector.collect_metrics() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to collect metrics");
                None
            }
        }
    }

    fn base_request(&self) -> CheckInRequest {
        CheckInRequest {
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            agent_version: AGENT_VERSION.to_string(),
            proto_version: PROTO_VERSION,
            ..Default::default()
        }
    }

    /// Wrap `message` in a request carrying the `grpc-timeout` deadline.
    fn deadline<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.config.rpc_timeout());
        request
    }

    /// Enforce the deadline locally as well.
    async fn with_deadline<T, F>(&self, call: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        let timeout = self.config.rpc_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result?.into_inner()),
            Err(_) => Err(AgentError::Timeout(timeout)),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Follow the interval the daemon asks for.
fn adopt_interval(resp: &CheckInResponse, period: &mut Duration, heartbeat: &mut tokio::time::Interval) {
    let Ok(secs) = u64::try_from(resp.check_interval_seconds) else {
        return;
    };
    let requested = Duration::from_secs(secs);
    if secs == 0 || requested == *period {
        return;
    }
    tracing::info!(interval_secs = secs, "Adopting check interval from daemon");
    *period = requested;
    *heartbeat = ticker(requested);
}
