//! TLS connection info for peer identity checks.

use std::net::SocketAddr;

/// Connection info extracted from TLS streams.
///
/// This is made available via `request.extensions()` in gRPC handlers,
/// allowing the check-in handler to bind a call to the certificate the
/// client presented.
#[derive(Debug, Clone, Default)]
pub struct TlsConnectInfo {
    /// Remote socket address of the client.
    pub remote_addr: Option<SocketAddr>,
    /// Common name of the verified client certificate, if one was presented.
    pub peer_subject: Option<String>,
}

impl TlsConnectInfo {
    /// Create a new TlsConnectInfo.
    pub fn new(remote_addr: Option<SocketAddr>, peer_subject: Option<String>) -> Self {
        Self {
            remote_addr,
            peer_subject,
        }
    }
}
