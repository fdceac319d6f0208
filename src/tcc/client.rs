//! `TccClient`: the send-side bandwidth estimation orchestrator that owns
//! `DelayBasedBwe`, `LossBasedBweV2` and `PacedSender`, and produces a
//! single `TargetTransferRate` for the rest of the transport (`spec.md`
//! §4.L).

use std::collections::VecDeque;

use bytes::Bytes;

use crate::clock::MonoMs;
use crate::trend_calculator::TrendCalculator;

use super::bitrate_prober::ProbeCluster;
use super::delay_based_bwe::DelayBasedBwe;
use super::loss_based_bwe_v2::{LossBasedBweV2, LossBasedBweV2Config};
use super::paced_sender::PacedSender;

const PROBE_MIN_PROBES: u32 = 5;
const PROBE_MIN_BYTES: u32 = 5_000;

const LOSS_HISTOGRAM_SIZE: usize = 24;
const AVAILABLE_BITRATE_EVENT_INTERVAL_MS: u64 = 1_000;
const DROP_EVENT_THRESHOLD: f64 = 0.75;
const RISE_EVENT_THRESHOLD: f64 = 1.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TargetTransferRate {
    pub bitrate_bps: f64,
    pub at_ms: MonoMs,
}

struct LossReport {
    num_packets: u64,
    num_lost: u64,
}

/// Recency-weighted loss fraction over the last 24 feedback reports,
/// weighting more recent reports more heavily (`spec.md` §4.L).
struct LossHistogram {
    reports: VecDeque<LossReport>,
}

impl LossHistogram {
    fn new() -> Self {
        Self {
            reports: VecDeque::with_capacity(LOSS_HISTOGRAM_SIZE),
        }
    }

    fn push(&mut self, num_packets: u64, num_lost: u64) {
        if self.reports.len() >= LOSS_HISTOGRAM_SIZE {
            self.reports.pop_front();
        }
        self.reports.push_back(LossReport { num_packets, num_lost });
    }

    fn weighted_loss_fraction(&self) -> f64 {
        if self.reports.is_empty() {
            return 0.0;
        }
        let n = self.reports.len();
        let mut weighted_lost = 0.0;
        let mut weighted_total = 0.0;
        for (i, report) in self.reports.iter().enumerate() {
            // Most recent report (last in the deque) gets the highest weight.
            let weight = (i + 1) as f64 / n as f64;
            weighted_lost += weight * report.num_lost as f64;
            weighted_total += weight * report.num_packets as f64;
        }
        if weighted_total <= 0.0 {
            0.0
        } else {
            weighted_lost / weighted_total
        }
    }
}

/// Synthesizes RTP padding packets sized to fill the pacer's probe or
/// padding budget when no real media packet is available to send.
pub struct RtpProbationGenerator {
    ssrc: u32,
    next_seq: u16,
}

impl RtpProbationGenerator {
    #[must_use]
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc, next_seq: 0 }
    }

    /// Builds a minimal RTP packet of exactly `size_bytes`, payload type
    /// 255 (reserved for internal use), carrying no media.
    #[must_use]
    pub fn generate(&mut self, size_bytes: usize) -> Bytes {
        let mut buf = vec![0u8; size_bytes.max(12)];
        buf[0] = 0x80;
        buf[1] = 0xFF;
        buf[2..4].copy_from_slice(&self.next_seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        self.next_seq = self.next_seq.wrapping_add(1);
        Bytes::from(buf)
    }
}

pub struct TccClientConfig {
    pub min_bitrate_bps: f64,
    pub max_bitrate_bps: f64,
    pub start_bitrate_bps: f64,
    pub loss_based: LossBasedBweV2Config,
}

/// Owns the delay-based estimator, the loss-based estimator, and the
/// pacer; smooths downstream-desired bitrate through a `TrendCalculator`
/// and emits `TargetTransferRate` changes per the thresholds in
/// `spec.md` §4.L.
pub struct TccClient {
    delay_based: DelayBasedBwe,
    loss_based: LossBasedBweV2,
    pacer: PacedSender,
    desired_bitrate: TrendCalculator,
    loss_histogram: LossHistogram,
    min_bitrate_bps: f64,
    max_bitrate_bps: f64,
    last_emitted: Option<TargetTransferRate>,
    last_emit_ms: Option<MonoMs>,
    next_probe_cluster_id: u16,
}

impl TccClient {
    #[must_use]
    pub fn new(config: TccClientConfig) -> Self {
        let (loss_based, _validation) = LossBasedBweV2::new(config.loss_based, config.start_bitrate_bps);
        Self {
            delay_based: DelayBasedBwe::new(config.start_bitrate_bps),
            loss_based,
            pacer: PacedSender::new(config.start_bitrate_bps),
            desired_bitrate: TrendCalculator::default(),
            loss_histogram: LossHistogram::new(),
            min_bitrate_bps: config.min_bitrate_bps,
            max_bitrate_bps: config.max_bitrate_bps,
            last_emitted: None,
            last_emit_ms: None,
            next_probe_cluster_id: 0,
        }
    }

    pub fn on_received_packet(
        &mut self,
        abs_send_time_24: u32,
        arrival_ms: MonoMs,
        size: u64,
        acked_bitrate_bps: Option<f64>,
    ) {
        self.delay_based.on_packet(abs_send_time_24, arrival_ms, size, acked_bitrate_bps);
    }

    pub fn on_transport_feedback(&mut self, now_ms: MonoMs, num_packets: u64, num_lost: u64, size_bytes: u64) {
        self.loss_histogram.push(num_packets, num_lost);
        self.loss_based.on_feedback(now_ms, num_packets, num_lost, size_bytes);
    }

    pub fn set_desired_bitrate_bps(&mut self, bitrate_bps: f64, now_ms: MonoMs) {
        self.desired_bitrate.update(bitrate_bps, now_ms);
    }

    #[must_use]
    pub fn pacer_mut(&mut self) -> &mut PacedSender {
        &mut self.pacer
    }

    #[must_use]
    pub fn loss_fraction(&self) -> f64 {
        self.loss_histogram.weighted_loss_fraction()
    }

    /// Recomputes the current target transfer rate and, if an emission is
    /// warranted under §4.L's thresholds, returns it and records it as
    /// the last emitted value.
    pub fn maybe_emit(&mut self, now_ms: MonoMs) -> Option<TargetTransferRate> {
        let delay_based_bps = self.delay_based.target_bitrate_bps();
        let loss_based_bps = self.loss_based.estimate(delay_based_bps);
        let mut bitrate_bps = delay_based_bps.min(loss_based_bps);
        let desired_cap = self.desired_bitrate.value();
        if desired_cap > 0.0 {
            bitrate_bps = bitrate_bps.min(desired_cap);
        }
        let bitrate_bps = bitrate_bps.clamp(self.min_bitrate_bps, self.max_bitrate_bps);
        self.pacer.set_pacing_rates_bps(bitrate_bps, bitrate_bps * 0.1);

        let candidate = TargetTransferRate { bitrate_bps, at_ms: now_ms };

        let should_emit = match self.last_emitted {
            None => true,
            Some(last) => {
                let interval_elapsed = self
                    .last_emit_ms
                    .map_or(true, |t| now_ms.saturating_sub(t) >= AVAILABLE_BITRATE_EVENT_INTERVAL_MS);
                let dropped = bitrate_bps <= last.bitrate_bps * DROP_EVENT_THRESHOLD;
                let rose = bitrate_bps >= last.bitrate_bps * RISE_EVENT_THRESHOLD;
                if rose {
                    self.queue_probe_cluster(bitrate_bps);
                }
                interval_elapsed || dropped || rose
            }
        };

        if should_emit {
            self.last_emitted = Some(candidate);
            self.last_emit_ms = Some(now_ms);
            Some(candidate)
        } else {
            None
        }
    }

    /// Queues a probe cluster at `target_bitrate_bps` so the pacer can
    /// confirm the estimator's bandwidth-increase guess with real traffic
    /// (`spec.md` §4.K).
    fn queue_probe_cluster(&mut self, target_bitrate_bps: f64) {
        let id = self.next_probe_cluster_id;
        self.next_probe_cluster_id = self.next_probe_cluster_id.wrapping_add(1);
        self.pacer.prober_mut().create_probe_clusters(&[ProbeCluster {
            id,
            target_bitrate_bps: target_bitrate_bps as u64,
            min_probes: PROBE_MIN_PROBES,
            min_bytes: PROBE_MIN_BYTES,
        }]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> TccClientConfig {
        TccClientConfig {
            min_bitrate_bps: 5_000.0,
            max_bitrate_bps: 10_000_000.0,
            start_bitrate_bps: 300_000.0,
            loss_based: LossBasedBweV2Config::default(),
        }
    }

    #[test]
    fn first_estimate_is_always_emitted() {
        let mut client = TccClient::new(default_config());
        assert!(client.maybe_emit(MonoMs(0)).is_some());
    }

    #[test]
    fn no_emission_before_interval_without_large_change() {
        let mut client = TccClient::new(default_config());
        client.maybe_emit(MonoMs(0));
        assert!(client.maybe_emit(MonoMs(100)).is_none());
    }

    #[test]
    fn emits_again_after_interval_elapses() {
        let mut client = TccClient::new(default_config());
        client.maybe_emit(MonoMs(0));
        assert!(client.maybe_emit(MonoMs(1_000)).is_some());
    }

    #[test]
    fn loss_histogram_reflects_weighted_recent_losses() {
        let mut client = TccClient::new(default_config());
        for _ in 0..5 {
            client.on_transport_feedback(MonoMs(0), 100, 0, 100 * 1200);
        }
        assert_eq!(client.loss_fraction(), 0.0);
        client.on_transport_feedback(MonoMs(0), 100, 50, 100 * 1200);
        assert!(client.loss_fraction() > 0.0);
    }

    #[test]
    fn probation_generator_produces_requested_size() {
        let mut gen = RtpProbationGenerator::new(42);
        let packet = gen.generate(200);
        assert_eq!(packet.len(), 200);
    }

    #[test]
    fn desired_bitrate_caps_the_emitted_estimate() {
        let mut client = TccClient::new(default_config());
        client.set_desired_bitrate_bps(50_000.0, MonoMs(0));
        let rate = client.maybe_emit(MonoMs(0)).unwrap();
        assert!(rate.bitrate_bps <= 50_000.0);
    }

    #[test]
    fn zero_desired_bitrate_does_not_clamp() {
        let mut client = TccClient::new(default_config());
        let rate = client.maybe_emit(MonoMs(0)).unwrap();
        assert!(rate.bitrate_bps > 0.0);
    }

    #[test]
    fn queue_probe_cluster_arms_the_pacers_prober() {
        let mut client = TccClient::new(default_config());
        assert!(!client.pacer_mut().prober_mut().is_probing());
        client.queue_probe_cluster(1_000_000.0);
        assert!(client.pacer_mut().prober_mut().is_probing());
    }

    #[test]
    fn a_rising_estimate_queues_a_probe_cluster() {
        let mut client = TccClient::new(default_config());
        client.maybe_emit(MonoMs(0));
        // Force the emitted candidate to read as a >=1.5x rise by directly
        // lowering the bookkeeping `maybe_emit` compares against.
        client.last_emitted = Some(TargetTransferRate {
            bitrate_bps: 1.0,
            at_ms: MonoMs(0),
        });
        client.maybe_emit(MonoMs(10));
        assert!(client.pacer_mut().prober_mut().is_probing());
    }
}
