//! `RateCalculator` — fixed-window byte/packet rate with millisecond
//! granularity (`spec.md` §4.A).

use crate::clock::MonoMs;

/// Converts a per-window byte (or packet) total into bits-per-second when
/// `update`'s `size` argument is a byte count.
const BITS_PER_BYTE: u64 = 8000;

/// Sliding-window rate estimator over a ring of per-millisecond buckets.
///
/// Used throughout the core (pacer budget filters, TCC client available
/// bitrate, per-consumer send rate) wherever a cheap, exact windowed rate is
/// needed.
#[derive(Debug)]
pub struct RateCalculator {
    window_size_ms: u64,
    scale: u64,
    buckets: Vec<u64>,
    oldest_time: Option<MonoMs>,
    newest_time: Option<MonoMs>,
    total_count: u64,
}

impl RateCalculator {
    #[must_use]
    pub fn new(window_size_ms: u64, scale: u64) -> Self {
        assert!(window_size_ms > 0, "window_size_ms must be positive");
        Self {
            window_size_ms,
            scale,
            buckets: vec![0; window_size_ms as usize],
            oldest_time: None,
            newest_time: None,
            total_count: 0,
        }
    }

    /// Rate calculator configured to report bits-per-second from a stream
    /// of byte counts, the shape every caller in this crate wants.
    #[must_use]
    pub fn bits_per_second(window_size_ms: u64) -> Self {
        Self::new(window_size_ms, BITS_PER_BYTE)
    }

    fn index(&self, t: MonoMs) -> usize {
        (t.0 % self.window_size_ms) as usize
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
        self.oldest_time = None;
        self.newest_time = None;
        self.total_count = 0;
    }

    /// Expires buckets strictly older than `now - window_size`. If the
    /// window has been silent for longer than its own span, all history is
    /// discarded — the only path that does so.
    fn advance(&mut self, now: MonoMs) {
        let Some(oldest) = self.oldest_time else {
            return;
        };
        if now.saturating_sub(oldest) >= self.window_size_ms * 2 {
            self.reset();
            return;
        }
        let Some(newest) = self.newest_time else {
            return;
        };
        let mut t = newest;
        while t < now {
            t = t.add_ms(1);
            if t.saturating_sub(oldest) >= self.window_size_ms {
                let idx = self.index(oldest);
                self.total_count = self.total_count.saturating_sub(self.buckets[idx]);
                self.buckets[idx] = 0;
                self.oldest_time = Some(oldest.add_ms(1));
            }
        }
    }

    /// Records `size` units (bytes, packets, ...) of activity at `now_ms`.
    ///
    /// Calls with `now_ms` older than the current oldest bucket are
    /// discarded: the clock is assumed monotonic and this should not
    /// happen in practice.
    pub fn update(&mut self, size: u64, now_ms: MonoMs) {
        if let Some(oldest) = self.oldest_time {
            if now_ms < oldest {
                return;
            }
        }
        self.advance(now_ms);
        if self.oldest_time.is_none() {
            self.oldest_time = Some(now_ms);
        }
        self.newest_time = Some(now_ms);
        let idx = self.index(now_ms);
        self.buckets[idx] = self.buckets[idx].saturating_add(size);
        self.total_count = self.total_count.saturating_add(size);
    }

    /// Reported rate at `now_ms`, expiring stale buckets first so a caller
    /// that stops calling `update` still sees the rate decay to zero.
    #[must_use]
    pub fn rate(&mut self, now_ms: MonoMs) -> u64 {
        self.advance(now_ms);
        if self.oldest_time.is_none() {
            return 0;
        }
        self.scale * self.total_count / self.window_size_ms
    }

    #[must_use]
    pub fn window_size_ms(&self) -> u64 {
        self.window_size_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_zero_before_any_update() {
        let mut rc = RateCalculator::new(1000, BITS_PER_BYTE);
        assert_eq!(rc.rate(MonoMs(0)), 0);
    }

    #[test]
    fn single_update_yields_scaled_rate() {
        let mut rc = RateCalculator::new(1000, BITS_PER_BYTE);
        rc.update(1000, MonoMs(0));
        assert_eq!(rc.rate(MonoMs(0)), BITS_PER_BYTE * 1000 / 1000);
    }

    #[test]
    fn rate_decays_monotonically_without_further_updates() {
        let mut rc = RateCalculator::new(1000, BITS_PER_BYTE);
        rc.update(1000, MonoMs(0));
        let r1 = rc.rate(MonoMs(500));
        let r2 = rc.rate(MonoMs(999));
        assert!(r2 <= r1);
    }

    #[test]
    fn long_silence_resets_the_window() {
        let mut rc = RateCalculator::new(1000, BITS_PER_BYTE);
        rc.update(5000, MonoMs(0));
        assert_eq!(rc.rate(MonoMs(5000)), 0);
    }

    #[test]
    fn out_of_order_update_before_oldest_is_discarded() {
        let mut rc = RateCalculator::new(1000, BITS_PER_BYTE);
        rc.update(1000, MonoMs(500));
        rc.update(1000, MonoMs(100));
        // The stale update must not have been counted.
        assert_eq!(rc.rate(MonoMs(500)), BITS_PER_BYTE * 1000 / 1000);
    }
}
