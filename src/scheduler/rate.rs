//! Process-wide rate governor.
//!
//! One token bucket per plugin: capacity and refill both derive from the
//! plugin's per-minute budget, with a floor of one token so trickle-rate
//! plugins can still make progress. Waiters queue FIFO on the bucket's
//! async mutex; a provider throttle empties the bucket and stalls refill
//! for the penalty window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct BucketState {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    penalty_until: Option<Instant>,
}

impl BucketState {
    fn new(rate_limit_per_minute: u32) -> Self {
        let refill_per_sec = f64::from(rate_limit_per_minute) / 60.0;
        let capacity = refill_per_sec.max(1.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
            penalty_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.penalty_until {
            if now < until {
                // Refill is frozen for the penalty window.
                self.last_refill = now;
                return;
            }
            self.penalty_until = None;
            self.last_refill = until;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// How long until at least one token exists, assuming no new penalty.
    fn time_until_token(&self, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;
        let mut deficit = 1.0 - self.tokens;
        if let Some(until) = self.penalty_until {
            if now < until {
                wait = until - now;
                deficit = 1.0; // bucket is empty for the whole penalty
            }
        }
        if self.refill_per_sec <= 0.0 {
            return wait + Duration::from_secs(60);
        }
        wait + Duration::from_secs_f64((deficit / self.refill_per_sec).max(0.0))
    }
}

struct Bucket {
    state: tokio::sync::Mutex<BucketState>,
}

pub struct RateGovernor {
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGovernor {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Declare a plugin's budget. Re-registering is a no-op so restarts of
    /// the registry cannot reset in-flight accounting.
    pub fn register(&self, plugin: &str, rate_limit_per_minute: u32) {
        self.buckets
            .lock()
            .entry(plugin.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    state: tokio::sync::Mutex::new(BucketState::new(rate_limit_per_minute)),
                })
            });
    }

    fn bucket(&self, plugin: &str) -> Arc<Bucket> {
        self.buckets
            .lock()
            .entry(plugin.to_string())
            .or_insert_with(|| {
                // Unregistered callers get the most conservative budget.
                Arc::new(Bucket {
                    state: tokio::sync::Mutex::new(BucketState::new(60)),
                })
            })
            .clone()
    }

    /// Take one token, waiting as long as it takes. FIFO within a plugin:
    /// the head waiter holds the bucket mutex across its sleep, so later
    /// arrivals cannot steal the token it is waiting for.
    pub async fn acquire(&self, plugin: &str) {
        let bucket = self.bucket(plugin);
        let mut state = bucket.state.lock().await;
        loop {
            let now = Instant::now();
            state.refill(now);
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }
            let wait = state.time_until_token(now);
            debug!(plugin, wait_ms = wait.as_millis() as u64, "rate governor waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Provider told us to back off: drop every banked token and freeze the
    /// refill for `secs`.
    pub async fn acquire_penalty(&self, plugin: &str, secs: u64) {
        let bucket = self.bucket(plugin);
        let mut state = bucket.state.lock().await;
        state.tokens = 0.0;
        state.penalty_until = Some(Instant::now() + Duration::from_secs(secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_capacity_then_refill_pace() {
        let governor = RateGovernor::new();
        governor.register("daily_bar", 120); // 2 tokens/sec, capacity 2

        let t0 = Instant::now();
        governor.acquire("daily_bar").await;
        governor.acquire("daily_bar").await;
        // Bucket exhausted; third acquire must wait ~500ms for refill.
        governor.acquire("daily_bar").await;
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_never_exceeds_budget_in_any_window() {
        let governor = RateGovernor::new();
        governor.register("p", 60); // 1/sec

        let start = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..5 {
            governor.acquire("p").await;
            stamps.push(start.elapsed());
        }
        // 1 banked token + 1/sec refill: 5 acquires need >= 3.9s.
        assert!(stamps[4] >= Duration::from_millis(3900), "{stamps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_freezes_refill() {
        let governor = RateGovernor::new();
        governor.register("p", 600); // 10/sec, capacity 10

        governor.acquire("p").await;
        governor.acquire_penalty("p", 30).await;

        let t0 = Instant::now();
        governor.acquire("p").await;
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_secs(30), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn min_one_token_capacity() {
        let governor = RateGovernor::new();
        governor.register("slow", 6); // 0.1 tokens/sec, capacity floored at 1

        let t0 = Instant::now();
        governor.acquire("slow").await; // banked token, instant
        assert!(t0.elapsed() < Duration::from_millis(50));

        governor.acquire("slow").await; // must wait ~10s for the next
        assert!(t0.elapsed() >= Duration::from_secs(9));
    }
}
