//! TLS configuration for the daemon.
//!
//! The daemon serves with a CA-issued certificate and accepts, but does
//! not require, client certificates chained to the same CA. Agents enroll
//! without one and reconnect with their issued leaf afterwards.

mod cert;
mod connect_info;
mod io;
mod server;

pub use cert::TlsIdentity;
pub use connect_info::TlsConnectInfo;
pub use io::TlsConnection;
pub use server::{TlsConfigError, TlsServerConfig};
