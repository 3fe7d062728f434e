//! Daemon assembly and the serve loop.
//!
//! [`Daemon::open`] wires the database, certificate authority and check-in
//! handler together; [`Daemon::serve`] binds the listener and runs until the
//! shutdown channel fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_auth::CertificateAuthority;
use fleet_proto::fleet_service_server::FleetServiceServer;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::auth::TokenRegistry;
use crate::ca::{self, CaError};
use crate::checkin::{CheckInHandler, HandlerConfig};
use crate::config::DaemonConfig;
use crate::db::Database;
use crate::directory::AgentDirectory;
use crate::events::{spawn_event_logger, EventBus, FleetEvent};
use crate::services::{EnrollmentRateLimiter, FleetServiceImpl};
use crate::tls::{TlsConfigError, TlsConnection, TlsServerConfig};

/// Maximum time allowed for a TLS handshake before the connection is dropped.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the stale-agent sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that stop the daemon from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Ca(#[from] CaError),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A fully wired daemon, ready to serve.
pub struct Daemon {
    config: DaemonConfig,
    ca: Arc<CertificateAuthority>,
    tokens: TokenRegistry,
    directory: AgentDirectory,
    events: EventBus,
}

impl Daemon {
    /// Open the database and load (or create) the CA under `config.data_dir`.
    pub async fn open(config: DaemonConfig) -> Result<Self, DaemonError> {
        let db_path = config.db_path();
        tracing::info!(path = %db_path.display(), "Opening database");
        let db = Database::open(&db_path).await?;

        let ca = ca::load_or_generate(
            &config.ca_cert_path(),
            &config.ca_key_path(),
            config.authority_config(),
        )?;

        Ok(Self::with_parts(config, db, ca))
    }

    /// Assemble a daemon from an already opened database and CA.
    pub fn with_parts(config: DaemonConfig, db: Database, ca: CertificateAuthority) -> Self {
        let tokens = TokenRegistry::new(db.pool().clone())
            .with_default_expiry(config.token_default_expiry());
        let directory = AgentDirectory::new(db.pool().clone());
        Self {
            config,
            ca: Arc::new(ca),
            tokens,
            directory,
            events: EventBus::new(),
        }
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Build the check-in handler for this daemon.
    pub fn handler(&self) -> CheckInHandler {
        let config = HandlerConfig {
            check_interval: Duration::from_secs(u64::from(self.config.check_interval_secs)),
            renewal_validity: self.config.authority_config().default_validity,
            ..HandlerConfig::default()
        };
        CheckInHandler::new(
            self.ca.clone(),
            self.tokens.clone(),
            self.directory.clone(),
            self.events.clone(),
            config,
        )
    }

    /// Build the gRPC service, including the enrollment rate limiter.
    pub fn service(&self) -> FleetServiceImpl {
        let limiter = EnrollmentRateLimiter::new(
            self.config.enroll_rate_per_second,
            self.config.enroll_burst,
        );
        FleetServiceImpl::new(self.handler(), limiter)
    }

    /// Bind the listener and serve until `shutdown` fires.
    pub async fn serve(self, shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind { addr, source })?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(), DaemonError> {
        let local_addr = listener.local_addr().ok();
        let router = Server::builder().add_service(FleetServiceServer::new(self.service()));

        let acceptor = if self.config.tls_enabled {
            let identity = ca::ensure_server_identity(
                &self.ca,
                &self.config.server_cert_path(),
                &self.config.server_key_path(),
                &self.config.server_names,
            )?;
            let tls_config = TlsServerConfig::new(&identity, self.ca.root_cert_der())?;
            tracing::info!(addr = ?local_addr, serial = %identity.serial_hex, "Fleet daemon listening (TLS)");
            Some(TlsAcceptor::from(tls_config.into_rustls_config()))
        } else {
            tracing::warn!(addr = ?local_addr, "Fleet daemon listening without TLS");
            None
        };

        let event_logger = spawn_event_logger(&self.events);
        let sweeper = spawn_stale_sweeper(
            self.directory.clone(),
            self.events.clone(),
            self.config.agent_timeout(),
            shutdown.subscribe(),
        );

        let mut server_shutdown = shutdown.subscribe();
        let signal = async move {
            let _ = server_shutdown.recv().await;
        };

        let result = if let Some(acceptor) = acceptor {
            let mut accept_shutdown = shutdown.subscribe();
            let incoming = async_stream::stream! {
                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            match result {
                                Ok((tcp_stream, peer_addr)) => {
                                    let acceptor = acceptor.clone();
                                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp_stream)).await {
                                        Ok(Ok(tls_stream)) => {
                                            tracing::debug!(peer = %peer_addr, "TLS handshake successful");
                                            yield Ok::<_, std::io::Error>(TlsConnection::new(tls_stream, Some(peer_addr)));
                                        }
                                        Ok(Err(e)) => {
                                            tracing::warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                                        }
                                        Err(_) => {
                                            tracing::warn!(peer = %peer_addr, timeout_secs = ?TLS_HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "TCP accept failed");
                                }
                            }
                        }
                        _ = accept_shutdown.recv() => {
                            tracing::info!("Shutdown signal received, stopping accept loop");
                            break;
                        }
                    }
                }
            };

            router.serve_with_incoming_shutdown(incoming, signal).await
        } else {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                .await
        };

        sweeper.abort();
        event_logger.abort();
        tracing::info!("Fleet daemon stopped");
        result.map_err(DaemonError::from)
    }
}

/// Periodically mark agents that stopped checking in as disconnected.
pub fn spawn_stale_sweeper(
    directory: AgentDirectory,
    events: EventBus,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_stale(&directory, &events, timeout).await;
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// One sweep pass. Returns the number of agents marked disconnected.
pub async fn sweep_stale(directory: &AgentDirectory, events: &EventBus, timeout: Duration) -> usize {
    match directory.mark_stale_disconnected(timeout).await {
        Ok(ids) => {
            for agent_id in &ids {
                tracing::info!(agent_id = %agent_id, "Agent marked disconnected");
                events.publish(FleetEvent::AgentDisconnected {
                    agent_id: agent_id.clone(),
                });
            }
            ids.len()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Stale agent sweep failed");
            0
        }
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
///
/// A handler that cannot be installed is logged and treated as never firing.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
