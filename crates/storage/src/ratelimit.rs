//! Token-bucket bandwidth limiting.
//!
//! One bucket per adapter and direction, refilled continuously, with a burst
//! of at most one second's worth of tokens.  Callers block until their
//! request is covered, which is what produces back-pressure on the worker
//! threads above.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TokenBucket {
    /// Bytes per second; also the burst capacity.
    rate: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// `rate` in bytes/second.  Returns `None` for 0 (unlimited).
    pub fn new(rate: u64) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        Some(Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate as f64,
                refilled_at: Instant::now(),
            }),
        })
    }

    /// Block until `bytes` tokens are available, then consume them.
    /// Requests larger than the burst are paid off in rate-sized slices.
    pub fn take(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let slice = remaining.min(self.rate);
            if let Some(wait) = self.try_take(slice) {
                std::thread::sleep(wait);
            } else {
                remaining -= slice;
            }
        }
    }

    /// Consume `amount` if covered, otherwise return how long to wait.
    fn try_take(&self, amount: u64) -> Option<Duration> {
        let mut state = self.state.lock().expect("token bucket mutex poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        state.refilled_at = now;

        if state.tokens >= amount as f64 {
            state.tokens -= amount as f64;
            None
        } else {
            let deficit = amount as f64 - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate as f64))
        }
    }
}
