//! Transport selection and connect-with-backoff.

use std::time::Duration;

use fleet_proto::fleet_service_client::FleetServiceClient;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::config::AgentConfig;
use crate::credentials::CredentialStore;
use crate::tls::{build_client_config, build_plaintext_channel, build_tls_channel};

/// How the channel to the daemon is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plaintext,
    /// Server verified against `ca.crt`; no client certificate.
    ServerAuth,
    /// Server verified and the leaf certificate presented.
    Mutual,
}

/// A connected client and the security it was established with.
pub struct Connection {
    pub client: FleetServiceClient<Channel>,
    pub kind: TransportKind,
}

/// Decide which transport the current on-disk credentials allow.
pub fn select_transport(config: &AgentConfig, store: &CredentialStore) -> TransportKind {
    if config.insecure {
        TransportKind::Plaintext
    } else if store.has_identity() {
        TransportKind::Mutual
    } else if store.has_ca() {
        TransportKind::ServerAuth
    } else {
        TransportKind::Plaintext
    }
}

/// Connect once with the best transport available.
///
/// Credentials that fail to load are logged and the connection falls back
/// to plaintext.
pub async fn connect(config: &AgentConfig, store: &CredentialStore) -> anyhow::Result<Connection> {
    let timeout = config.rpc_timeout();
    let addr = config.server_addr.as_str();

    let tls = match select_transport(config, store) {
        TransportKind::Plaintext => None,
        TransportKind::Mutual => match store.load_identity() {
            Ok(identity) => Some((
                build_client_config(&identity.ca_der, Some((&identity.cert_der, &identity.key))),
                TransportKind::Mutual,
            )),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load credentials, using plaintext");
                None
            }
        },
        TransportKind::ServerAuth => match store.load_ca() {
            Ok(ca_der) => Some((build_client_config(&ca_der, None), TransportKind::ServerAuth)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load CA certificate, using plaintext");
                None
            }
        },
    };

    match tls {
        Some((Ok(tls_config), kind)) => {
            let channel = build_tls_channel(addr, tls_config, timeout).await?;
            Ok(Connection {
                client: FleetServiceClient::new(channel),
                kind,
            })
        }
        Some((Err(e), _)) => {
            tracing::warn!(error = %e, "Invalid TLS credentials, using plaintext");
            plaintext(addr, timeout).await
        }
        None => plaintext(addr, timeout).await,
    }
}

async fn plaintext(addr: &str, timeout: Duration) -> anyhow::Result<Connection> {
    let channel = build_plaintext_channel(addr, timeout).await?;
    Ok(Connection {
        client: FleetServiceClient::new(channel),
        kind: TransportKind::Plaintext,
    })
}

/// Exponential delay: doubles from `base` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const BASE: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(5 * 60);

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::BASE, Self::MAX)
    }
}

/// Connect, retrying forever with backoff. `None` once `shutdown` fires.
pub async fn connect_with_backoff(
    config: &AgentConfig,
    store: &CredentialStore,
    backoff: &mut Backoff,
    shutdown: &CancellationToken,
) -> Option<Connection> {
    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return None,
            result = connect(config, store) => result,
        };
        match attempt {
            Ok(conn) => {
                backoff.reset();
                tracing::info!(addr = %config.server_addr, transport = ?conn.kind, "Connected to daemon");
                return Some(conn);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Failed to connect to daemon"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
