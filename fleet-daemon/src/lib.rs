//! Fleet daemon: certificate authority, enrollment tokens, agent directory
//! and the agent-facing check-in service.

pub mod auth;
pub mod ca;
pub mod checkin;
pub mod config;
pub mod daemon;
pub mod db;
pub mod directory;
pub mod events;
pub mod services;
pub mod tls;

pub use checkin::{CheckInError, CheckInHandler, HandlerConfig};
pub use config::DaemonConfig;
pub use daemon::{Daemon, DaemonError};
