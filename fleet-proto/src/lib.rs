//! Fleet Protocol - Protobuf types for agent-daemon communication

/// Generated protobuf types
pub mod fleet {
    pub mod v1 {
        #![allow(clippy::derive_partial_eq_without_eq)]
        tonic::include_proto!("fleet.v1");
    }
}

pub use fleet::v1::*;

/// Protocol version spoken by this build of the daemon and agent.
///
/// The daemon accepts this version and exactly one below it.
pub const PROTO_VERSION: u32 = 1;

impl VersionStatus {
    /// Whether a response with this status should be treated as processed.
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Ok | Self::Deprecated | Self::UpdateAvailable)
    }
}
