//! Strictly monotonic request nonce.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// The exchange rejects nonces it considers to be in the past, and its idea
/// of "now" has been observed to drift ahead of ours. Offsetting into the
/// future sidesteps the clock-sync quirk.
const NONCE_SKEW_SECS: u64 = 1500 * 60;

/// Produces nonces that are strictly increasing across threads.
///
/// The value is derived from wall-clock time (plus [`NONCE_SKEW_SECS`]) and
/// bumped by one whenever the clock value would not exceed the previous
/// nonce, so rapid calls and clock jitter cannot produce a duplicate.
#[derive(Debug, Default)]
pub struct NonceGen {
    last: Mutex<u64>,
}

impl NonceGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + NONCE_SKEW_SECS;
        let nonce = if clock <= *last { *last + 1 } else { clock };
        *last = nonce;
        nonce
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn nonce_is_strictly_increasing() {
        let gen = NonceGen::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let n = gen.next();
            assert!(n > prev, "nonce {n} not greater than {prev}");
            prev = n;
        }
    }

    #[test]
    fn nonce_is_offset_into_the_future() {
        let gen = NonceGen::new();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(gen.next() >= now + NONCE_SKEW_SECS);
    }

    #[test]
    fn nonce_is_strictly_increasing_across_threads() {
        let gen = Arc::new(NonceGen::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = Arc::clone(&gen);
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| gen.next()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), len, "duplicate nonce issued");
    }
}
