use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use rand::Rng;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::sleep;

/// Token bucket shared by every in-flight request of one provider.
///
/// One token is released every `interval`; up to `burst` may accumulate.
/// With a burst of 1 this behaves like the fixed per-call delay providers
/// expect, but concurrent workers queue on the bucket instead of each
/// sleeping on its own.
pub struct RateLimiter {
    limiter: Option<DefaultDirectRateLimiter>,
    jitter_ms: u64,
}

impl RateLimiter {
    pub fn new(interval: Duration, burst: u32, jitter_ms: u64) -> Self {
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        // A zero interval means unthrottled
        let limiter = Quota::with_period(interval)
            .map(|quota| Governor::direct(quota.allow_burst(burst)));

        Self { limiter, jitter_ms }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None, jitter_ms: 0 }
    }

    /// Wait until the next request may go out.
    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        if self.jitter_ms > 0 {
            let delay = {
                let mut rng = rand::thread_rng();
                rng.gen_range(0..=self.jitter_ms)
            };
            sleep(Duration::from_millis(delay)).await;
        }
    }
}
