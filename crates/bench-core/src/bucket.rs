use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Scaling factor for sub-token precision (one token = `SCALE` units).
const SCALE: u128 = 1_000_000;

/// Token bucket with integer-only math, shareable across tasks.
///
/// Refills `rate` tokens per `window` up to `capacity` stored tokens. The
/// same primitive drives per-second request pacing and the per-minute
/// OpenWhisk activation-polling cap.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u64,
    window_micros: u128,
    capacity: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Current token count, scaled by `SCALE`.
    tokens: u128,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, window: Duration, capacity: u64) -> Self {
        Self {
            rate,
            window_micros: window.as_micros().max(1),
            capacity,
            state: Mutex::new(BucketState {
                tokens: (capacity as u128) * SCALE,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(state.last_refill).as_micros();
        if elapsed_micros == 0 {
            return;
        }

        let tokens_to_add = (self.rate as u128) * elapsed_micros * SCALE / self.window_micros;
        state.tokens = state.tokens.saturating_add(tokens_to_add);

        let max_tokens = (self.capacity as u128) * SCALE;
        if state.tokens > max_tokens {
            state.tokens = max_tokens;
        }

        state.last_refill = now;
    }

    /// Try to acquire a token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= SCALE {
            state.tokens -= SCALE;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and acquire it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                if state.tokens >= SCALE {
                    state.tokens -= SCALE;
                    return;
                }
                if self.rate == 0 {
                    Duration::from_secs(1)
                } else {
                    let deficit = SCALE - state.tokens;
                    // time until the deficit refills, in microseconds
                    let wait_micros =
                        deficit * self.window_micros / ((self.rate as u128) * SCALE);
                    Duration::from_micros((wait_micros as u64).max(1))
                }
            };
            sleep(wait).await;
        }
    }
}
