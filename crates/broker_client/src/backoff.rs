//! Capped exponential backoff with jitter for broker reconnect loops.

use rand::Rng;
use std::time::Duration;

/// Double `current` up to `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Add up to 25% random jitter so consumers restarting together do not
/// hammer the broker in lockstep.
pub fn with_jitter(base: Duration) -> Duration {
    let jitter_ms = base.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let max = Duration::from_secs(30);
        let mut d = Duration::from_millis(500);
        let mut seen = Vec::new();
        for _ in 0..10 {
            d = next_backoff(d, max);
            seen.push(d);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[1], Duration::from_secs(2));
        assert_eq!(*seen.last().unwrap(), max);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let j = with_jitter(base);
            assert!(j >= base && j < base + Duration::from_secs(1));
        }
    }
}
