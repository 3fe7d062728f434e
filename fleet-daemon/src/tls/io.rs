//! Wrapper type for TLS streams that implements tonic's Connected trait.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use fleet_auth::parse_certificate;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tonic::transport::server::Connected;

use super::TlsConnectInfo;

/// Wrapper around TlsStream that implements tonic's Connected trait.
pub struct TlsConnection {
    inner: TlsStream<TcpStream>,
    remote_addr: Option<SocketAddr>,
    peer_subject: Option<String>,
}

impl TlsConnection {
    pub fn new(tls_stream: TlsStream<TcpStream>, remote_addr: Option<SocketAddr>) -> Self {
        // rustls has already verified the chain; only the name is needed here
        let (_, session) = tls_stream.get_ref();
        let peer_subject = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|cert| parse_certificate(cert.as_ref()).ok())
            .map(|info| info.subject_cn)
            .filter(|cn| !cn.is_empty());

        Self {
            inner: tls_stream,
            remote_addr,
            peer_subject,
        }
    }
}

impl Connected for TlsConnection {
    type ConnectInfo = TlsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        TlsConnectInfo::new(self.remote_addr, self.peer_subject.clone())
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
