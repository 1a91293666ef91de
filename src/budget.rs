//! Rate & Byte Budget (C7) — per-connection sliding 60-second windows (§4.7).
//!
//! Same lazy-purge-then-push shape as `daemon/src/ipc/mod.rs`'s
//! `ConnectionRateLimiter`, generalized from a fixed per-minute cap to the
//! spec's rolling window with a configurable limit, and extended with a byte
//! budget tracked the same way. Purge happens on every check, bounding
//! memory to `O(mps)` / `O(bps / avg_msg_size)` entries per connection —
//! never a background sweep, since the check itself is the only access
//! point (§4.7, §9).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateByteBudget {
    mps: u32,
    bps: u64,
    requests: VecDeque<Instant>,
    bytes: VecDeque<(Instant, u64)>,
    bytes_sum: u64,
}

impl RateByteBudget {
    pub fn new(mps: u32, bps: u64) -> Self {
        Self {
            mps,
            bps,
            requests: VecDeque::new(),
            bytes: VecDeque::new(),
            bytes_sum: 0,
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&front) = self.requests.front() {
            if now.duration_since(front) > WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(front, n)) = self.bytes.front() {
            if now.duration_since(front) > WINDOW {
                self.bytes_sum -= n;
                self.bytes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Purge then check+record a request. Returns `true` if accepted.
    pub fn check_rate(&mut self) -> bool {
        let now = Instant::now();
        self.purge(now);
        if self.requests.len() as u32 >= self.mps {
            return false;
        }
        self.requests.push_back(now);
        true
    }

    /// Purge then check whether `n` additional bytes fit under budget,
    /// without recording them — use `consume_bytes` to record after the
    /// caller commits to the operation (§4.7: response bytes count too).
    pub fn check_bytes(&mut self, n: u64) -> bool {
        let now = Instant::now();
        self.purge(now);
        self.bytes_sum + n <= self.bps
    }

    pub fn consume_bytes(&mut self, n: u64) {
        let now = Instant::now();
        self.bytes.push_back((now, n));
        self.bytes_sum += n;
    }
}
