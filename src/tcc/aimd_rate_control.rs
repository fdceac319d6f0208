//! Additive-Increase Multiplicative-Decrease rate control shared by the
//! delay-based estimator and the REMB fallback (`spec.md` §4.H/§4.I).

use crate::clock::MonoMs;

const DEFAULT_BACKOFF_FACTOR: f64 = 0.85;
const MIN_BITRATE_BPS: f64 = 5_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateControlRegion {
    NearMax,
    AboveMax,
    MaxUnknown,
}

pub struct AimdRateControl {
    current_bitrate_bps: f64,
    min_bitrate_bps: f64,
    backoff_factor: f64,
    region: RateControlRegion,
    last_decrease_ms: Option<MonoMs>,
    time_last_bitrate_change_ms: Option<MonoMs>,
}

impl AimdRateControl {
    #[must_use]
    pub fn new(start_bitrate_bps: f64) -> Self {
        Self {
            current_bitrate_bps: start_bitrate_bps,
            min_bitrate_bps: MIN_BITRATE_BPS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            region: RateControlRegion::MaxUnknown,
            last_decrease_ms: None,
            time_last_bitrate_change_ms: None,
        }
    }

    #[must_use]
    pub fn bitrate_bps(&self) -> f64 {
        self.current_bitrate_bps
    }

    /// `TimeToReduceFurther`: true once at least 200ms elapsed since the
    /// last decrease, or no decrease has happened yet.
    #[must_use]
    pub fn time_to_reduce_further(&self, now_ms: MonoMs) -> bool {
        match self.last_decrease_ms {
            None => true,
            Some(last) => now_ms.0.saturating_sub(last.0) >= 200,
        }
    }

    pub fn update(&mut self, usage: super::delay_based_bwe::BandwidthUsage, now_ms: MonoMs, acked_bitrate_bps: Option<f64>) {
        use super::delay_based_bwe::BandwidthUsage as Usage;
        match usage {
            Usage::Normal => {
                self.additive_increase(now_ms);
            }
            Usage::Overusing => {
                if let Some(acked) = acked_bitrate_bps {
                    if self.time_to_reduce_further(now_ms) {
                        self.current_bitrate_bps =
                            (acked * self.backoff_factor).max(self.min_bitrate_bps);
                        self.region = RateControlRegion::NearMax;
                        self.last_decrease_ms = Some(now_ms);
                        self.time_last_bitrate_change_ms = Some(now_ms);
                    }
                }
            }
            Usage::Underusing => {}
        }
    }

    fn additive_increase(&mut self, now_ms: MonoMs) {
        let response_time_ms = 100.0;
        let time_since_last_update_ms = self
            .time_last_bitrate_change_ms
            .map_or(response_time_ms, |t| (now_ms.0.saturating_sub(t.0)) as f64);
        // Multiplicative while the max is unknown, additive once near it.
        self.current_bitrate_bps = match self.region {
            RateControlRegion::MaxUnknown => self.current_bitrate_bps * 1.08f64.powf(
                (time_since_last_update_ms / 1000.0).min(1.0),
            ),
            _ => {
                let alpha = 1.0 + (time_since_last_update_ms / response_time_ms).min(1.0) * 0.05;
                self.current_bitrate_bps * alpha
            }
        };
        self.time_last_bitrate_change_ms = Some(now_ms);
    }

    pub fn set_estimate(&mut self, bitrate_bps: f64, now_ms: MonoMs) {
        self.current_bitrate_bps = bitrate_bps.max(self.min_bitrate_bps);
        self.time_last_bitrate_change_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcc::delay_based_bwe::BandwidthUsage;

    #[test]
    fn normal_usage_increases_bitrate() {
        let mut aimd = AimdRateControl::new(100_000.0);
        aimd.update(BandwidthUsage::Normal, MonoMs(0), None);
        aimd.update(BandwidthUsage::Normal, MonoMs(500), None);
        assert!(aimd.bitrate_bps() > 100_000.0);
    }

    #[test]
    fn overuse_with_acked_bitrate_decreases() {
        let mut aimd = AimdRateControl::new(500_000.0);
        aimd.update(BandwidthUsage::Overusing, MonoMs(0), Some(300_000.0));
        assert!(aimd.bitrate_bps() < 500_000.0);
        assert!(aimd.bitrate_bps() >= MIN_BITRATE_BPS);
    }
}
