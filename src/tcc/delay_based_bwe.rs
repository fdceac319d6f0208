//! `InterArrival` + `TrendlineEstimator` delay-based bandwidth estimation
//! (`spec.md` §4.I).

use std::collections::VecDeque;

use crate::clock::MonoMs;
use crate::rtp::extensions::abs_send_time_to_32_bits;

const GROUP_LENGTH_MS: i64 = 5;
const TRENDLINE_WINDOW_SIZE: usize = 10;
const STREAM_TIMEOUT_MS: u64 = 2_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthUsage {
    Normal,
    Underusing,
    Overusing,
}

struct Group {
    first_send_32: u32,
    first_arrival_ms: MonoMs,
    last_send_32: u32,
    last_arrival_ms: MonoMs,
    size: u64,
}

/// Groups packets by ~5ms send-time buckets, per the abs-send-time derived
/// `InterArrival` algorithm, and computes (timestamp delta, arrival delta,
/// size delta) between consecutive completed groups.
pub struct InterArrival {
    current_group: Option<Group>,
    last_completed: Option<Group>,
}

impl Default for InterArrival {
    fn default() -> Self {
        Self::new()
    }
}

impl InterArrival {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_group: None,
            last_completed: None,
        }
    }

    pub fn reset(&mut self) {
        self.current_group = None;
        self.last_completed = None;
    }

    /// Feeds one packet's (abs-send-time shifted to 32 bits, arrival ms,
    /// size). Returns `(ts_delta, arrival_delta_ms, size_delta)` whenever a
    /// group boundary completes.
    pub fn compute_deltas(
        &mut self,
        send_time_32: u32,
        arrival_ms: MonoMs,
        size: u64,
    ) -> Option<(i64, i64, i64)> {
        // abs-send-time is a 1/64 s fixed-point format shifted to 32 bits;
        // `GROUP_LENGTH_MS` worth of ticks is `GROUP_LENGTH_MS * 65536 /
        // 1000`.
        let group_length_ticks = (GROUP_LENGTH_MS * 65_536) / 1000;

        match &mut self.current_group {
            None => {
                self.current_group = Some(Group {
                    first_send_32: send_time_32,
                    first_arrival_ms: arrival_ms,
                    last_send_32: send_time_32,
                    last_arrival_ms: arrival_ms,
                    size,
                });
                None
            }
            Some(g) => {
                let within_group =
                    (send_time_32.wrapping_sub(g.first_send_32) as i32) < group_length_ticks as i32;
                if within_group {
                    g.last_send_32 = send_time_32;
                    g.last_arrival_ms = arrival_ms;
                    g.size += size;
                    None
                } else {
                    let finished = self.current_group.take().unwrap();
                    let result = self.last_completed.as_ref().map(|prev| {
                        let ts_delta = finished.first_send_32.wrapping_sub(prev.first_send_32) as i32 as i64;
                        let arrival_delta =
                            finished.first_arrival_ms.0 as i64 - prev.first_arrival_ms.0 as i64;
                        let size_delta = finished.size as i64 - prev.size as i64;
                        (ts_delta, arrival_delta, size_delta)
                    });
                    self.last_completed = Some(finished);
                    self.current_group = Some(Group {
                        first_send_32: send_time_32,
                        first_arrival_ms: arrival_ms,
                        last_send_32: send_time_32,
                        last_arrival_ms: arrival_ms,
                        size,
                    });
                    result
                }
            }
        }
    }
}

struct DelayHistoryEntry {
    arrival_time_ms: i64,
    smoothed_delay_ms: f64,
}

/// Linear regression of (arrival_time, smoothed one-way delay) over a
/// sliding window, classifying `BandwidthUsage`.
pub struct TrendlineEstimator {
    window_size: usize,
    smoothing_coef: f64,
    history: VecDeque<DelayHistoryEntry>,
    first_arrival_time_ms: Option<i64>,
    accumulated_delay_ms: f64,
    smoothed_delay_ms: f64,
    threshold: f64,
    k_up: f64,
    k_down: f64,
    overuse_counter: u32,
    last_update_ms: Option<i64>,
    usage: BandwidthUsage,
}

impl Default for TrendlineEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendlineEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window_size: TRENDLINE_WINDOW_SIZE,
            smoothing_coef: 0.9,
            history: VecDeque::new(),
            first_arrival_time_ms: None,
            accumulated_delay_ms: 0.0,
            smoothed_delay_ms: 0.0,
            threshold: 12.5,
            k_up: 0.0087,
            k_down: 0.039,
            overuse_counter: 0,
            last_update_ms: None,
            usage: BandwidthUsage::Normal,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn update(&mut self, ts_delta: i64, arrival_delta_ms: i64, size_delta: i64, arrival_ms: MonoMs) -> BandwidthUsage {
        let _ = size_delta;
        // One-way-delay variation: arrival delta minus the send-time delta,
        // with the latter scaled from 1/65536s abs-send-time ticks to ms.
        let raw_delay_ms = arrival_delta_ms as f64 - (ts_delta as f64) * 1000.0 / 65_536.0;

        self.accumulated_delay_ms += raw_delay_ms;
        self.smoothed_delay_ms =
            self.smoothing_coef * self.smoothed_delay_ms + (1.0 - self.smoothing_coef) * self.accumulated_delay_ms;

        let arrival_time_ms = arrival_ms.0 as i64;
        let first = *self.first_arrival_time_ms.get_or_insert(arrival_time_ms);
        self.history.push_back(DelayHistoryEntry {
            arrival_time_ms: arrival_time_ms - first,
            smoothed_delay_ms: self.smoothed_delay_ms,
        });
        if self.history.len() > self.window_size {
            self.history.pop_front();
        }

        let slope = self.linear_regression_slope();
        self.classify(slope, arrival_time_ms)
    }

    fn linear_regression_slope(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let n = self.history.len() as f64;
        let mean_x: f64 = self.history.iter().map(|e| e.arrival_time_ms as f64).sum::<f64>() / n;
        let mean_y: f64 = self.history.iter().map(|e| e.smoothed_delay_ms).sum::<f64>() / n;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for e in &self.history {
            let dx = e.arrival_time_ms as f64 - mean_x;
            let dy = e.smoothed_delay_ms - mean_y;
            numerator += dx * dy;
            denominator += dx * dx;
        }
        if denominator.abs() < 1e-9 {
            0.0
        } else {
            numerator / denominator
        }
    }

    fn classify(&mut self, slope: f64, now_ms: i64) -> BandwidthUsage {
        let time_delta_ms = self.last_update_ms.map_or(0, |last| now_ms - last) as f64;
        self.last_update_ms = Some(now_ms);
        let modified_trend = (self.history.len().min(self.window_size) as f64) * slope;

        self.usage = if modified_trend > self.threshold {
            self.overuse_counter += 1;
            BandwidthUsage::Overusing
        } else if modified_trend < -self.threshold {
            self.overuse_counter = 0;
            BandwidthUsage::Underusing
        } else {
            self.overuse_counter = 0;
            BandwidthUsage::Normal
        };

        let k = if modified_trend > 0.0 { self.k_up } else { self.k_down };
        self.threshold += k * (modified_trend.abs() - self.threshold) * time_delta_ms.max(1.0) / 1000.0;
        self.threshold = self.threshold.clamp(6.0, 600.0);

        self.usage
    }
}

/// Owns `InterArrival`+`TrendlineEstimator`+AIMD; the single delay-based
/// estimator instance feeding the TCC client.
pub struct DelayBasedBwe {
    inter_arrival: InterArrival,
    trendline: TrendlineEstimator,
    rate_control: super::aimd_rate_control::AimdRateControl,
    last_packet_ms: Option<MonoMs>,
}

impl DelayBasedBwe {
    #[must_use]
    pub fn new(start_bitrate_bps: f64) -> Self {
        Self {
            inter_arrival: InterArrival::new(),
            trendline: TrendlineEstimator::new(),
            rate_control: super::aimd_rate_control::AimdRateControl::new(start_bitrate_bps),
            last_packet_ms: None,
        }
    }

    #[must_use]
    pub fn target_bitrate_bps(&self) -> f64 {
        self.rate_control.bitrate_bps()
    }

    pub fn on_packet(&mut self, abs_send_time_24: u32, arrival_ms: MonoMs, size: u64, acked_bitrate_bps: Option<f64>) {
        if let Some(last) = self.last_packet_ms {
            if arrival_ms.0.saturating_sub(last.0) > STREAM_TIMEOUT_MS {
                self.inter_arrival.reset();
                self.trendline.reset();
            }
        }
        self.last_packet_ms = Some(arrival_ms);

        let send_32 = abs_send_time_to_32_bits(abs_send_time_24);
        if let Some((ts_delta, arrival_delta, size_delta)) =
            self.inter_arrival.compute_deltas(send_32, arrival_ms, size)
        {
            let usage = self.trendline.update(ts_delta, arrival_delta, size_delta, arrival_ms);
            self.rate_control.update(usage, arrival_ms, acked_bitrate_bps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_inter_arrival_times_stay_normal() {
        let mut bwe = DelayBasedBwe::new(300_000.0);
        let mut send_24 = 0u32;
        let mut now = MonoMs(0);
        for _ in 0..40 {
            bwe.on_packet(send_24, now, 1200, Some(300_000.0));
            send_24 = send_24.wrapping_add(1 << 6); // ~1ms in 24-bit abs-send-time units
            now = now.add_ms(1);
        }
        assert!(bwe.target_bitrate_bps() > 0.0);
    }
}
