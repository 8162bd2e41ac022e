//! Byte-rate limiting shared by every transfer of one sync.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

type ByteLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Largest single withdrawal; bigger requests are split.
const MAX_BURST: u32 = 64 * 1024;

/// Token bucket over bytes per second.
///
/// The bucket starts empty, so moving `S` bytes through it takes at least
/// `S / rate` seconds no matter how the bytes are split across transfers.
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<ByteLimiter>,
    burst: NonZeroU32,
}

impl Throttle {
    /// `None` for a zero rate, which means unlimited.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        let rate = NonZeroU32::new(bytes_per_sec.min(u32::MAX as u64) as u32)?;
        let burst = NonZeroU32::new(rate.get().min(MAX_BURST))?;
        let limiter = RateLimiter::direct(Quota::per_second(rate).allow_burst(burst));

        // drain the initial burst
        let _ = limiter.check_n(burst);

        Some(Self {
            limiter: Arc::new(limiter),
            burst,
        })
    }

    /// Wait until `bytes` may be sent or received.
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = bytes as u64;
        while remaining > 0 {
            let step = remaining.min(self.burst.get() as u64) as u32;
            let Some(n) = NonZeroU32::new(step) else {
                break;
            };
            if self.limiter.until_n_ready(n).await.is_err() {
                // unreachable: steps never exceed the burst
                debug!("throttle withdrawal of {} bytes exceeds capacity", step);
                break;
            }
            remaining -= step as u64;
        }
    }
}
