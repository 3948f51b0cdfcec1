//! Wall-clock timestamps.
//!
//! All persisted timestamps are fractional Unix seconds (`f64`), which is
//! also the wire format for `X-Node-Ts` and every `since` cursor.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as fractional Unix seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Next `registered_at` value for a record that previously carried `prev`.
///
/// Monotonic per record: even if the wall clock stepped backwards, the new
/// value is strictly greater than the old one, so the change always clears
/// a peer's delta filter.
pub fn bump(prev: f64) -> f64 {
    now().max(prev + 0.001)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_strictly_monotonic() {
        let t = now();
        assert!(bump(t) > t);
        // Even against a far-future previous value
        let future = t + 1e6;
        assert!(bump(future) > future);
    }
}
