use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::RateProfile;

/// Token bucket shared by every send to one platform.
///
/// Callers queue on the async mutex in arrival order; the holder sleeps
/// until a token is available, so a send is delayed but never dropped.
#[derive(Debug)]
pub struct RateGate {
    per_second: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
    /// Set when the platform told us to back off
    paused_until: Option<Instant>,
}

impl RateGate {
    /// A non-positive rate is treated as one send per second.
    pub fn new(profile: RateProfile) -> Self {
        let per_second = if profile.per_second > 0.0 {
            profile.per_second
        } else {
            1.0
        };
        let burst = f64::from(profile.burst.max(1));
        Self {
            per_second,
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
                paused_until: None,
            }),
        }
    }

    /// Wait for and consume one token.
    pub async fn acquire(&self) {
        let mut bucket = self.state.lock().await;

        if let Some(until) = bucket.paused_until.take() {
            if until > Instant::now() {
                sleep_until(until).await;
            }
        }

        self.refill(&mut bucket);
        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::try_from_secs_f64(deficit / self.per_second)
                .unwrap_or(Duration::from_secs(1));
            sleep(wait).await;
            self.refill(&mut bucket);
        }
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }

    /// Hold every sender for at least `delay`, e.g. after a 429.
    ///
    /// A delay past the timer's range is ignored; callers bound what they pass.
    pub async fn pause_for(&self, delay: Duration) {
        let Some(until) = Instant::now().checked_add(delay) else {
            tracing::warn!(delay_secs = delay.as_secs(), "Ignoring out-of-range pause");
            return;
        };
        let mut bucket = self.state.lock().await;
        if bucket.paused_until.map_or(true, |current| current < until) {
            bucket.paused_until = Some(until);
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.per_second).min(self.burst);
        bucket.refilled_at = now;
    }
}
