//! Monotonic time source used for TTL and idle checks.

use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Whether `a` is strictly later than `b`.
    fn is_after(&self, a: Instant, b: Instant) -> bool {
        a > b
    }
}

/// Reads `tokio::time::Instant`, so paused test time applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
