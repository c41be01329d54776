//! Randomised delays for heartbeats and reconnect backoff

use rand::Rng;
use std::time::Duration;

/// A uniformly random delay in `[0, max_jitter]`
pub fn jitter(max_jitter: Duration) -> Duration {
    let max_ms = max_jitter.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Random jitter in milliseconds, up to `max_ms`
pub fn jitter_ms(max_ms: u64) -> u64 {
    jitter(Duration::from_millis(max_ms)).as_millis() as u64
}

/// `base` plus a random jitter of at most `max_jitter`
pub fn jittered(base: Duration, max_jitter: Duration) -> Duration {
    base + jitter(max_jitter)
}
