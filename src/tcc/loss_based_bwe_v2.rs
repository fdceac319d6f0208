//! LossBasedBweV2: Newton-iteration MAP estimator over a Bernoulli
//! per-packet loss model (`spec.md` §4.J).

use crate::clock::MonoMs;

/// ~35-parameter configuration; `is_config_valid` rejects the whole set if
/// any field is out of its documented range, per `spec.md` §4.J.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct LossBasedBweV2Config {
    pub enabled: bool,
    pub bandwidth_rampup_upper_bound_factor: f64,
    pub rampup_acceleration_max_factor: f64,
    pub rampup_acceleration_maxout_time_ms: u64,
    pub candidate_factors: Vec<f64>,
    pub higher_bandwidth_bias_factor: f64,
    pub higher_log_bandwidth_bias_factor: f64,
    pub inherent_loss_lower_bound: f64,
    pub loss_threshold_of_high_bandwidth_preference: f64,
    pub bandwidth_preference_smoothing_factor: f64,
    pub inherent_loss_upper_bound_bandwidth_balance: f64,
    pub inherent_loss_upper_bound_factor: f64,
    pub newton_step_size: f64,
    pub newton_iterations: u32,
    pub moving_intercept_step_size: f64,
    pub observation_duration_lower_bound_ms: u64,
    pub observation_window_size: usize,
    pub sending_rate_smoothing_factor: f64,
    pub instant_upper_bound_temporal_weight_factor: f64,
    pub instant_upper_bound_bandwidth_balance: f64,
    pub instant_upper_bound_loss_offset: f64,
    pub temporal_weight_factor: f64,
    pub min_num_observations: usize,
    pub lower_bound_by_acked_rate_factor: f64,
    pub hold_duration_factor: f64,
    pub use_byte_loss_rate: bool,
    pub padding_duration_ms: u64,
    pub bound_best_candidate: bool,
    pub pace_at_loss_based_estimate: bool,
    pub median_sending_rate_factor: f64,
    pub high_loss_rate_threshold: f64,
    pub bandwidth_cap_at_high_loss_rate: f64,
    pub slope_of_bwe_high_loss_func: f64,
    pub probe_integration_enabled: bool,
    pub trendline_integration_enabled: bool,
    pub not_increase_if_inherent_loss_less_than_average_loss: bool,
    pub min_bitrate_bps: f64,
    pub max_bitrate_bps: f64,
}

impl Default for LossBasedBweV2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            bandwidth_rampup_upper_bound_factor: 1.3,
            rampup_acceleration_max_factor: 0.0,
            rampup_acceleration_maxout_time_ms: 10_000,
            candidate_factors: vec![1.02, 1.0, 0.95],
            higher_bandwidth_bias_factor: 0.0002,
            higher_log_bandwidth_bias_factor: 0.02,
            inherent_loss_lower_bound: 1e-3,
            loss_threshold_of_high_bandwidth_preference: 0.15,
            bandwidth_preference_smoothing_factor: 0.002,
            inherent_loss_upper_bound_bandwidth_balance: 14_000.0,
            inherent_loss_upper_bound_factor: 1_000_000.0,
            newton_step_size: 0.75,
            newton_iterations: 1,
            moving_intercept_step_size: 0.04,
            observation_duration_lower_bound_ms: 250,
            observation_window_size: 50,
            sending_rate_smoothing_factor: 0.0,
            instant_upper_bound_temporal_weight_factor: 0.9,
            instant_upper_bound_bandwidth_balance: 14_000.0,
            instant_upper_bound_loss_offset: 0.05,
            temporal_weight_factor: 0.9,
            min_num_observations: 3,
            lower_bound_by_acked_rate_factor: 0.0,
            hold_duration_factor: 0.0,
            use_byte_loss_rate: false,
            padding_duration_ms: 0,
            bound_best_candidate: true,
            pace_at_loss_based_estimate: false,
            median_sending_rate_factor: 2.0,
            high_loss_rate_threshold: 1.0,
            bandwidth_cap_at_high_loss_rate: 500_000.0,
            slope_of_bwe_high_loss_func: 1_000.0,
            probe_integration_enabled: false,
            trendline_integration_enabled: false,
            not_increase_if_inherent_loss_less_than_average_loss: true,
            min_bitrate_bps: 5_000.0,
            max_bitrate_bps: 100_000_000.0,
        }
    }
}

impl LossBasedBweV2Config {
    /// `is_config_valid`: every ratio/probability field must lie in its
    /// documented range; a configuration failing this disables the
    /// estimator (`spec.md` §7 `ConfigurationInvalid`).
    #[must_use]
    pub fn validate(&self) -> Result<(), crate::error::ConfigurationInvalid> {
        let invalid = |field: &'static str, reason: &str| crate::error::ConfigurationInvalid {
            field,
            reason: reason.to_string(),
        };
        if !(0.0..1.0).contains(&self.inherent_loss_lower_bound) {
            return Err(invalid("inherent_loss_lower_bound", "must be in [0, 1)"));
        }
        if self.newton_iterations == 0 {
            return Err(invalid("newton_iterations", "must be >= 1"));
        }
        if self.observation_window_size == 0 {
            return Err(invalid("observation_window_size", "must be >= 1"));
        }
        if self.candidate_factors.iter().any(|f| *f <= 0.0) {
            return Err(invalid("candidate_factors", "all factors must be > 0"));
        }
        if self.min_bitrate_bps <= 0.0 || self.max_bitrate_bps <= self.min_bitrate_bps {
            return Err(invalid("min_bitrate_bps/max_bitrate_bps", "min must be > 0 and < max"));
        }
        if !(0.0..=1.0).contains(&self.temporal_weight_factor) {
            return Err(invalid("temporal_weight_factor", "must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Observation {
    pub num_packets: u64,
    pub num_lost_packets: u64,
    pub sending_rate_bps: f64,
    pub id: u64,
}

#[derive(Clone, Copy, Debug)]
struct ChannelParameters {
    inherent_loss: f64,
    loss_limited_bandwidth_bps: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossBasedState {
    DelayBasedEstimate,
    Increasing,
    Decreasing,
}

pub struct LossBasedBweV2 {
    config: LossBasedBweV2Config,
    enabled: bool,
    current: ChannelParameters,
    observations: Vec<Observation>,
    next_observation_id: u64,
    partial_num_packets: u64,
    partial_num_lost: u64,
    partial_size_bytes: u64,
    partial_start_ms: Option<MonoMs>,
    bandwidth_limit_in_current_window: f64,
    state: LossBasedState,
    last_decrease_ms: Option<MonoMs>,
    average_reported_loss_ratio: f64,
}

impl LossBasedBweV2 {
    /// Returns `Err` with the estimator left disabled (subsequent
    /// `estimate` calls fall back to the delay-based bound) when
    /// `config` fails validation.
    pub fn new(config: LossBasedBweV2Config, start_bitrate_bps: f64) -> (Self, Result<(), crate::error::ConfigurationInvalid>) {
        let validation = config.validate();
        let enabled = config.enabled && validation.is_ok();
        let min_bitrate = config.min_bitrate_bps;
        let estimator = Self {
            config,
            enabled,
            current: ChannelParameters {
                inherent_loss: 1e-3,
                loss_limited_bandwidth_bps: start_bitrate_bps.max(min_bitrate),
            },
            observations: Vec::new(),
            next_observation_id: 0,
            partial_num_packets: 0,
            partial_num_lost: 0,
            partial_size_bytes: 0,
            partial_start_ms: None,
            bandwidth_limit_in_current_window: f64::INFINITY,
            state: LossBasedState::DelayBasedEstimate,
            last_decrease_ms: None,
            average_reported_loss_ratio: 0.0,
        };
        (estimator, validation)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn state(&self) -> LossBasedState {
        self.state
    }

    /// Accumulates one feedback's worth of (packets, losses, bytes);
    /// emits an `Observation` once the accumulated send-time span reaches
    /// `observation_duration_lower_bound_ms`.
    pub fn on_feedback(&mut self, now_ms: MonoMs, num_packets: u64, num_lost: u64, size_bytes: u64) {
        if !self.enabled {
            return;
        }
        self.partial_start_ms.get_or_insert(now_ms);
        self.partial_num_packets += num_packets;
        self.partial_num_lost += num_lost;
        self.partial_size_bytes += size_bytes;

        let Some(start) = self.partial_start_ms else { return };
        let elapsed = now_ms.0.saturating_sub(start.0);
        if elapsed < self.config.observation_duration_lower_bound_ms {
            return;
        }
        let duration_s = (elapsed as f64 / 1000.0).max(0.001);
        let sending_rate_bps = (self.partial_size_bytes as f64 * 8.0) / duration_s;
        let id = self.next_observation_id;
        self.next_observation_id += 1;
        let observation = Observation {
            num_packets: self.partial_num_packets,
            num_lost_packets: self.partial_num_lost,
            sending_rate_bps,
            id,
        };
        let window = self.config.observation_window_size;
        let idx = (id as usize) % window;
        if self.observations.len() < window {
            self.observations.push(observation);
        } else {
            self.observations[idx] = observation;
        }

        if observation.num_packets > 0 {
            self.average_reported_loss_ratio = observation.num_lost_packets as f64 / observation.num_packets as f64;
        }

        self.partial_num_packets = 0;
        self.partial_num_lost = 0;
        self.partial_size_bytes = 0;
        self.partial_start_ms = None;

        self.update_estimate(now_ms);
    }

    fn candidate_upper_bound(&self, delay_based_estimate_bps: Option<f64>) -> f64 {
        let mut bound = self.config.max_bitrate_bps.min(self.bandwidth_limit_in_current_window);
        if self.config.trendline_integration_enabled {
            if let Some(delay_based) = delay_based_estimate_bps {
                bound = bound.min(delay_based * self.config.bandwidth_rampup_upper_bound_factor);
            }
        }
        bound
    }

    fn loss_probability(&self, bw_bps: f64, inherent_loss: f64, sending_rate_bps: f64) -> f64 {
        let p = inherent_loss + (1.0 - inherent_loss) * (1.0 - bw_bps / sending_rate_bps).max(0.0);
        p.clamp(1e-6, 1.0 - 1e-6)
    }

    fn objective(&self, bw_bps: f64, inherent_loss: f64) -> f64 {
        if self.observations.is_empty() {
            return f64::NEG_INFINITY;
        }
        let n = self.observations.len();
        let mut sum = 0.0;
        for (i, obs) in self.observations.iter().rev().enumerate() {
            if obs.sending_rate_bps <= 0.0 {
                continue;
            }
            let t_w = self.config.temporal_weight_factor.powi(i as i32);
            let p = self.loss_probability(bw_bps, inherent_loss, obs.sending_rate_bps);
            let lost = obs.num_lost_packets as f64;
            let received = (obs.num_packets - obs.num_lost_packets) as f64;
            let log_likelihood = lost * p.ln() + received * (1.0 - p).ln();
            let bw_bias = self.config.higher_bandwidth_bias_factor * bw_bps
                + self.config.higher_log_bandwidth_bias_factor * (1.0 + bw_bps).ln();
            sum += t_w * (log_likelihood + bw_bias * obs.num_packets as f64);
        }
        let _ = n;
        sum
    }

    fn newton_refine(&self, bw_bps: f64, inherent_loss: f64) -> f64 {
        let mut loss = inherent_loss;
        for _ in 0..self.config.newton_iterations {
            let eps = 1e-4;
            let f_plus = self.objective_with_loss(bw_bps, loss + eps);
            let f_minus = self.objective_with_loss(bw_bps, loss - eps);
            let f0 = self.objective_with_loss(bw_bps, loss);
            let derivative = (f_plus - f_minus) / (2.0 * eps);
            let second_derivative = (f_plus - 2.0 * f0 + f_minus) / (eps * eps);
            if second_derivative.abs() > 1e-9 {
                loss -= self.config.newton_step_size * derivative / second_derivative;
            }
            loss = loss.clamp(self.config.inherent_loss_lower_bound, 1.0 - 1e-6);
        }
        loss
    }

    fn objective_with_loss(&self, bw_bps: f64, inherent_loss: f64) -> f64 {
        self.objective(bw_bps, inherent_loss)
    }

    fn update_estimate(&mut self, now_ms: MonoMs) {
        if self.observations.is_empty() {
            return;
        }
        let delay_based_estimate_bps = None; // supplied externally by the orchestrator when integration is on.
        let upper_bound = self.candidate_upper_bound(delay_based_estimate_bps);

        let mut best_bw = self.current.loss_limited_bandwidth_bps;
        let mut best_loss = self.current.inherent_loss;
        let mut best_objective = f64::NEG_INFINITY;

        for factor in &self.config.candidate_factors {
            let candidate_bw = (self.current.loss_limited_bandwidth_bps * factor)
                .clamp(self.config.min_bitrate_bps, upper_bound);
            let refined_loss = self.newton_refine(candidate_bw, self.current.inherent_loss);
            let score = self.objective(candidate_bw, refined_loss);
            if score > best_objective {
                best_objective = score;
                best_bw = candidate_bw;
                best_loss = refined_loss;
            }
        }

        if self.config.not_increase_if_inherent_loss_less_than_average_loss
            && best_bw > self.current.loss_limited_bandwidth_bps
            && self.average_reported_loss_ratio > best_loss
        {
            best_bw = self.current.loss_limited_bandwidth_bps;
        }

        if best_bw < self.current.loss_limited_bandwidth_bps {
            self.last_decrease_ms = Some(now_ms);
        }

        self.state = if best_bw > self.current.loss_limited_bandwidth_bps {
            LossBasedState::Increasing
        } else if best_bw < self.current.loss_limited_bandwidth_bps {
            LossBasedState::Decreasing
        } else {
            self.state
        };

        self.current = ChannelParameters {
            inherent_loss: best_loss,
            loss_limited_bandwidth_bps: best_bw,
        };
    }

    /// `CalculateInstantUpperBound`, kept pure (no side effect on
    /// `current_estimate`, per `spec.md` §9's explicit open-question
    /// resolution: the source's side-effectful write is not reproduced).
    #[must_use]
    pub fn instant_upper_bound(&self) -> f64 {
        if self.average_reported_loss_ratio <= self.config.instant_upper_bound_loss_offset {
            return f64::INFINITY;
        }
        let denom = self.average_reported_loss_ratio - self.config.instant_upper_bound_loss_offset;
        let mut limit = if denom > 1e-6 {
            self.config.instant_upper_bound_bandwidth_balance / denom
        } else {
            f64::INFINITY
        };
        if self.average_reported_loss_ratio > self.config.high_loss_rate_threshold {
            let capped = self.config.bandwidth_cap_at_high_loss_rate
                - self.config.slope_of_bwe_high_loss_func * self.average_reported_loss_ratio;
            limit = limit.min(capped.max(self.config.min_bitrate_bps));
        }
        limit
    }

    /// `min(current.bw, instant_upper_bound, delay_based_estimate)`.
    #[must_use]
    pub fn estimate(&self, delay_based_estimate_bps: f64) -> f64 {
        if !self.enabled {
            return delay_based_estimate_bps;
        }
        self.current
            .loss_limited_bandwidth_bps
            .min(self.instant_upper_bound())
            .min(delay_based_estimate_bps)
            .clamp(self.config.min_bitrate_bps, self.config.max_bitrate_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_disables_estimator() {
        let mut config = LossBasedBweV2Config::default();
        config.newton_iterations = 0;
        let (estimator, validation) = LossBasedBweV2::new(config, 300_000.0);
        assert!(validation.is_err());
        assert!(!estimator.is_enabled());
        assert_eq!(estimator.estimate(250_000.0), 250_000.0);
    }

    #[test]
    fn bounds_hold_within_min_and_max() {
        let config = LossBasedBweV2Config::default();
        let (mut est, validation) = LossBasedBweV2::new(config, 300_000.0);
        assert!(validation.is_ok());
        let mut now = MonoMs(0);
        for _ in 0..5 {
            est.on_feedback(now, 100, 40, 100 * 1200);
            now = now.add_ms(300);
        }
        let bw = est.estimate(10_000_000.0);
        assert!(bw >= est.config.min_bitrate_bps);
        assert!(bw <= est.config.max_bitrate_bps);
        if est.state() == LossBasedState::Decreasing {
            assert!(bw <= 10_000_000.0);
        }
    }

    #[test]
    fn heavy_loss_pulls_estimate_down() {
        let config = LossBasedBweV2Config::default();
        let (mut est, _) = LossBasedBweV2::new(config, 1_000_000.0);
        let mut now = MonoMs(0);
        for _ in 0..10 {
            est.on_feedback(now, 100, 60, 100 * 1200);
            now = now.add_ms(300);
        }
        assert!(est.estimate(10_000_000.0) < 1_000_000.0);
    }
}
