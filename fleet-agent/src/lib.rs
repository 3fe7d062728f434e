//! Fleet agent: enrolls with the daemon, keeps its certificate fresh and
//! reports host health on a fixed interval.

pub mod config;
pub mod credentials;
pub mod inspector;
pub mod runtime;
pub mod state;
pub mod tls;
pub mod transport;

pub use config::AgentConfig;
pub use inspector::{HostInspector, SystemInspector};
pub use runtime::{Agent, AgentError};
