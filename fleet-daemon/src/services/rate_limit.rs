//! Rate limiting for enrollment attempts.
//!
//! Only check-ins without an agent id count; heartbeats from enrolled
//! agents are never throttled.

use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tonic::Status;

const DEFAULT_PER_SECOND: NonZeroU32 = NonZeroU32::MIN.saturating_add(1);
const DEFAULT_BURST: NonZeroU32 = NonZeroU32::MIN.saturating_add(9);

/// Process-wide limiter shared by every connection.
#[derive(Clone)]
pub struct EnrollmentRateLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl EnrollmentRateLimiter {
    /// Create a limiter allowing `per_second` sustained enrollments with
    /// bursts of up to `burst_size`. Zero falls back to the defaults
    /// (2/s, burst 10).
    pub fn new(per_second: u32, burst_size: u32) -> Self {
        let per_second = NonZeroU32::new(per_second).unwrap_or(DEFAULT_PER_SECOND);
        let burst_size = NonZeroU32::new(burst_size).unwrap_or(DEFAULT_BURST);

        let quota = Quota::per_second(per_second).allow_burst(burst_size);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Returns `Err(Status::resource_exhausted)` once the quota is spent.
    pub fn check(&self) -> Result<(), Status> {
        self.limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(retry_after_ms, "Enrollment rate limit hit");
            Status::resource_exhausted("too many enrollment attempts, retry later")
        })
    }
}

impl Default for EnrollmentRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SECOND.get(), DEFAULT_BURST.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limiter_allows_burst() {
        let limiter = EnrollmentRateLimiter::new(1, 5);

        for i in 0..5 {
            assert!(
                limiter.check().is_ok(),
                "Request {} should be allowed within burst",
                i
            );
        }

        let err = limiter.check().unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_rate_limiter_refills() {
        let limiter = EnrollmentRateLimiter::new(10, 1);

        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());

        // 10 per second = one cell every 100ms
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(limiter.check().is_ok());
    }

    #[test]
    fn test_zero_falls_back_to_defaults() {
        let limiter = EnrollmentRateLimiter::new(0, 0);
        for _ in 0..10 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_clones_share_quota() {
        let limiter = EnrollmentRateLimiter::new(1, 1);
        let other = limiter.clone();
        assert!(limiter.check().is_ok());
        assert!(other.check().is_err());
    }
}
