use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::utils::TimeSource;

/// A single identifier's token bucket.
///
/// Tokens regenerate continuously at `capacity / refill_interval_ms` per
/// millisecond and are capped at `capacity`. Fractional tokens are kept
/// internally; removal is in whole tokens.
pub struct TokenBucket {
    capacity: u64,
    refill_interval_ms: u64,
    state: Mutex<BucketState>,
    time_source: Arc<dyn TimeSource>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u64, refill_interval_ms: u64, time_source: Arc<dyn TimeSource>) -> Self {
        let now = time_source.now_ms();
        Self {
            capacity,
            refill_interval_ms,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill_ms: now,
            }),
            time_source,
        }
    }

    /// Refill, then remove `n` tokens if that many are available.
    ///
    /// Returns `false` and leaves the balance untouched when fewer than `n`
    /// tokens are available.
    pub fn try_remove_tokens(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }

        let mut state = self.lock();
        self.refill(&mut state);

        let requested = n as f64;
        if state.tokens >= requested {
            state.tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Current balance after accounting for elapsed time
    pub fn tokens_remaining(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_interval_ms(&self) -> u64 {
        self.refill_interval_ms
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state is two plain numbers, always consistent between statements.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.time_source.now_ms();
        let elapsed_ms = now - state.last_refill_ms;

        // Clock stepped backwards: no refill, and refill restarts from the
        // earlier reading once the clock moves forward again.
        if elapsed_ms <= 0 {
            state.last_refill_ms = state.last_refill_ms.min(now);
            return;
        }

        let refill = elapsed_ms as f64 / self.refill_interval_ms as f64 * self.capacity as f64;
        state.tokens = (state.tokens + refill).min(self.capacity as f64);
        state.last_refill_ms = now;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_interval_ms", &self.refill_interval_ms)
            .field("state", &*self.lock())
            .finish()
    }
}
