//! Token bucket rate limiter for streamed repair rows.
//!
//! [`Throttle`] limits the rate of outgoing repair traffic so that repair
//! does not starve client I/O. Tokens are bytes. A rate of zero disables
//! throttling.

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::debug;

/// Token bucket rate limiter for repair bandwidth.
///
/// The bucket refills at `bytes_per_sec` and holds at most one second's
/// worth of tokens.
pub struct Throttle {
    bytes_per_sec: u64,
    state: tokio::sync::Mutex<ThrottleState>,
}

struct ThrottleState {
    available: f64,
    last_refill: Instant,
}

impl Throttle {
    /// Create a throttle. `0` means unlimited.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes_per_sec,
            state: tokio::sync::Mutex::new(ThrottleState {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Whether the throttle lets everything through.
    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// The configured rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Wait until `bytes` may be sent.
    ///
    /// Requests larger than the bucket are consumed in bucket-sized chunks.
    pub async fn acquire(&self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.bytes_per_sec);
            self.acquire_chunk(chunk as f64).await;
            remaining -= chunk;
        }
    }

    async fn acquire_chunk(&self, bytes: f64) {
        let rate = self.bytes_per_sec as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.available = (state.available + elapsed * rate).min(rate);
                state.last_refill = now;

                if state.available >= bytes {
                    state.available -= bytes;
                    return;
                }
                Duration::from_secs_f64((bytes - state.available) / rate)
            };

            debug!(wait_ms = wait.as_millis(), bytes, "throttle: waiting for tokens");
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("bytes_per_sec", &self.bytes_per_sec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let throttle = Throttle::new(0);
        assert!(throttle.is_unlimited());
        let start = std::time::Instant::now();
        throttle.acquire(u64::MAX).await;
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_burst_then_wait() {
        let throttle = Throttle::new(10_000);
        let start = std::time::Instant::now();
        // Bucket starts full.
        throttle.acquire(10_000).await;
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
        // Empty now: 1000 bytes need ~100ms.
        throttle.acquire(1_000).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_request_larger_than_bucket() {
        let throttle = Throttle::new(20_000);
        let start = std::time::Instant::now();
        // One full bucket plus 4000 bytes at 20k/s.
        throttle.acquire(24_000).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(150));
        assert_eq!(throttle.rate(), 20_000);
    }
}
