//! Test harnesses for check-in E2E tests.
//!
//! Uses tonic's pattern of passing server directly to client (no network).

use fleet_auth::{generate_key_and_csr, AuthorityConfig, CertificateAuthority, PrivateKey};
use fleet_daemon::db::Database;
use fleet_daemon::services::FleetServiceImpl;
use fleet_daemon::{Daemon, DaemonConfig};
use fleet_proto::fleet_service_client::FleetServiceClient;
use fleet_proto::fleet_service_server::FleetServiceServer;
use fleet_proto::{CheckInRequest, CheckInResponse, PROTO_VERSION};

pub type DirectClient = FleetServiceClient<FleetServiceServer<FleetServiceImpl>>;

/// Test daemon backed by in-memory SQLite and a fresh CA.
pub struct TestDaemon {
    pub daemon: Daemon,
}

impl TestDaemon {
    pub async fn new() -> Self {
        Self::with_config(DaemonConfig::default()).await
    }

    pub async fn with_config(config: DaemonConfig) -> Self {
        let db = Database::open_in_memory()
            .await
            .expect("Failed to create in-memory database");
        let ca = CertificateAuthority::generate(AuthorityConfig::default())
            .expect("Failed to generate CA");
        Self {
            daemon: Daemon::with_parts(config, db, ca),
        }
    }

    /// Create a token and return its raw secret.
    pub async fn create_token(&self, max_uses: i64) -> String {
        self.daemon
            .tokens()
            .create_token("test", max_uses, None)
            .await
            .expect("Failed to create token")
            .token
    }

    /// Create a client that talks directly to this daemon (no network).
    pub fn client(&self) -> DirectClient {
        FleetServiceClient::new(FleetServiceServer::new(self.daemon.service()))
    }
}

/// Agent side of a test: a hostname, and the key behind its latest CSR.
pub struct TestAgent {
    pub hostname: String,
    pub key: Option<PrivateKey>,
}

impl TestAgent {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            key: None,
        }
    }

    fn base_request(&self) -> CheckInRequest {
        CheckInRequest {
            hostname: self.hostname.clone(),
            platform: "linux/amd64".to_string(),
            agent_version: "0.3.0".to_string(),
            proto_version: PROTO_VERSION,
            ..Default::default()
        }
    }

    /// Enrollment request carrying a fresh CSR.
    pub fn enroll_request(&mut self, token: &str) -> CheckInRequest {
        let (key, csr) =
            generate_key_and_csr(&self.hostname, &self.hostname).expect("Failed to build CSR");
        self.key = Some(key);
        CheckInRequest {
            enroll_token: token.to_string(),
            certificate_request: csr,
            ..self.base_request()
        }
    }

    pub fn heartbeat_request(&self, agent_id: &str) -> CheckInRequest {
        CheckInRequest {
            agent_id: agent_id.to_string(),
            ..self.base_request()
        }
    }

    /// Heartbeat that also asks for a renewed certificate.
    pub fn renewal_request(&mut self, agent_id: &str) -> CheckInRequest {
        let (key, csr) =
            generate_key_and_csr(agent_id, &self.hostname).expect("Failed to build CSR");
        self.key = Some(key);
        CheckInRequest {
            certificate_request: csr,
            ..self.heartbeat_request(agent_id)
        }
    }

    pub async fn enroll(
        &mut self,
        client: &mut DirectClient,
        token: &str,
    ) -> Result<CheckInResponse, tonic::Status> {
        let request = self.enroll_request(token);
        client.check_in(request).await.map(|r| r.into_inner())
    }
}
