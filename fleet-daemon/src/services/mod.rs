//! gRPC service implementations.

mod fleet;
mod rate_limit;

pub use fleet::FleetServiceImpl;
pub use rate_limit::EnrollmentRateLimiter;
