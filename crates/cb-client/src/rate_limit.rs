//! Token-bucket rate limiter bounding aggregate outbound throughput.
//!
//! One bucket is shared by every job issuing legacy calls from this process,
//! so the engine never exceeds the legacy system's rate ceiling no matter how
//! many jobs run in parallel. State is in-memory only; it resets on restart,
//! which is acceptable because the bucket only bounds the current process.

use cb_common::OfficeId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity equal to the refill rate.
///
/// When the bucket is empty, `acquire` sleeps exactly `1 / rate` seconds (the
/// time for one token to accrue) instead of polling, which yields a smooth
/// outbound rate rather than bursts. Refill and consume happen in a single
/// critical section so concurrent callers cannot over-issue tokens.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = requests_per_second.max(f64::MIN_POSITIVE);
        Self {
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
            capacity: rate,
            refill_rate: rate,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Suspend until at least one token is available, then consume it.
    ///
    /// The lock is held across the wait so callers drain in arrival order.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens < 1.0 {
            // Sleep the exact time for one token to accrue, then refill.
            let wait = Duration::from_secs_f64(1.0 / self.refill_rate);
            tokio::time::sleep(wait).await;
            self.refill(&mut state);
        }

        state.tokens = (state.tokens - 1.0).max(0.0);
    }

    /// Acquire a token, then run the operation.
    pub async fn execute<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.acquire().await;
        op().await
    }

    /// Restore the bucket to full capacity.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    /// Read the current token count. Refills as a side effect so the
    /// observation reflects elapsed time.
    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

/// Bucket selection facade: one process-wide bucket (default) or one bucket
/// per office, chosen by configuration.
pub enum RateLimiters {
    Global(Arc<RateLimiter>),
    PerOffice {
        requests_per_second: f64,
        buckets: DashMap<OfficeId, Arc<RateLimiter>>,
    },
}

impl RateLimiters {
    pub fn global(requests_per_second: f64) -> Self {
        Self::Global(Arc::new(RateLimiter::new(requests_per_second)))
    }

    pub fn per_office(requests_per_second: f64) -> Self {
        Self::PerOffice {
            requests_per_second,
            buckets: DashMap::new(),
        }
    }

    pub fn for_office(&self, office_id: OfficeId) -> Arc<RateLimiter> {
        match self {
            Self::Global(limiter) => limiter.clone(),
            Self::PerOffice {
                requests_per_second,
                buckets,
            } => buckets
                .entry(office_id)
                .or_insert_with(|| Arc::new(RateLimiter::new(*requests_per_second)))
                .clone(),
        }
    }
}
