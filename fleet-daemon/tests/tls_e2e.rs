//! Check-in over a real TLS socket.
//!
//! Enrollment happens with server-auth TLS only; the issued leaf is then
//! presented as a client certificate and bound to the claimed agent id.

use std::sync::Arc;

use fleet_auth::{generate_key_and_csr, AuthorityConfig, CertificateAuthority, PrivateKey};
use fleet_daemon::db::Database;
use fleet_daemon::{Daemon, DaemonConfig};
use fleet_proto::fleet_service_client::FleetServiceClient;
use fleet_proto::{CheckInRequest, PROTO_VERSION};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpListener;
use tonic::transport::Channel;

fn roots(ca_der: &[u8]) -> Arc<RootCertStore> {
    let mut store = RootCertStore::empty();
    store.add(CertificateDer::from(ca_der.to_vec())).unwrap();
    Arc::new(store)
}

async fn connect(port: u16, config: ClientConfig) -> FleetServiceClient<Channel> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_http2()
        .build();
    let channel = Channel::from_shared(format!("https://localhost:{}", port))
        .unwrap()
        .connect_with_connector(connector)
        .await
        .expect("TLS connect failed");
    FleetServiceClient::new(channel)
}

fn request(hostname: &str) -> CheckInRequest {
    CheckInRequest {
        hostname: hostname.to_string(),
        platform: "linux/amd64".to_string(),
        agent_version: "0.3.0".to_string(),
        proto_version: PROTO_VERSION,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_enroll_then_mutual_tls_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        data_dir: dir.path().to_path_buf(),
        server_names: vec!["localhost".to_string()],
        ..DaemonConfig::default()
    };

    let db = Database::open_in_memory().await.unwrap();
    let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
    let ca_der = ca.root_cert_der().to_vec();
    let daemon = Daemon::with_parts(config, db, ca);
    let token = daemon
        .tokens()
        .create_token("tls", 1, None)
        .await
        .unwrap()
        .token;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let server = tokio::spawn(daemon.serve_on(listener, shutdown_tx.clone()));

    // server-auth only: enrollment works without a client certificate
    let anonymous = ClientConfig::builder()
        .with_root_certificates(roots(&ca_der))
        .with_no_client_auth();
    let mut enroll_client = connect(port, anonymous).await;

    let (key, csr) = generate_key_and_csr("web-01", "web-01").unwrap();
    let enrolled = enroll_client
        .check_in(CheckInRequest {
            enroll_token: token,
            certificate_request: csr,
            ..request("web-01")
        })
        .await
        .unwrap()
        .into_inner();
    let id = enrolled.assigned_agent_id.clone();
    assert!(!id.is_empty());
    assert!(dir.path().join("server.crt").exists());

    // mutual TLS with the issued leaf
    let mutual = client_auth_config(&enrolled.ca_certificate, &enrolled.signed_certificate, &key);
    let mut client = connect(port, mutual).await;

    let resp = client
        .check_in(CheckInRequest {
            agent_id: id.clone(),
            ..request("web-01")
        })
        .await
        .unwrap()
        .into_inner();
    assert!(resp.acknowledged);

    // the certificate binds the identity: another id is refused
    let err = client
        .check_in(CheckInRequest {
            agent_id: "someone-else".to_string(),
            ..request("web-01")
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::PermissionDenied);

    drop(enroll_client);
    drop(client);
    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_untrusted_root_fails_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        data_dir: dir.path().to_path_buf(),
        server_names: vec!["localhost".to_string()],
        ..DaemonConfig::default()
    };

    let db = Database::open_in_memory().await.unwrap();
    let ca = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
    let daemon = Daemon::with_parts(config, db, ca);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let server = tokio::spawn(daemon.serve_on(listener, shutdown_tx.clone()));

    let stranger = CertificateAuthority::generate(AuthorityConfig::default()).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(roots(stranger.root_cert_der()))
        .with_no_client_auth();
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_http2()
        .build();
    let result = Channel::from_shared(format!("https://localhost:{}", port))
        .unwrap()
        .connect_with_connector(connector)
        .await;
    assert!(result.is_err());

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

fn client_auth_config(ca_der: &[u8], cert_der: &[u8], key: &PrivateKey) -> ClientConfig {
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_pkcs8_der().to_vec()));
    ClientConfig::builder()
        .with_root_certificates(roots(ca_der))
        .with_client_auth_cert(vec![CertificateDer::from(cert_der.to_vec())], key_der)
        .unwrap()
}
