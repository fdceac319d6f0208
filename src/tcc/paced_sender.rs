//! Token-bucket pacer: separate media/padding budgets draining at the
//! current target bitrate, with a next-fire timer bounded to [5ms, 25ms]
//! (`spec.md` §4.K).

use std::collections::VecDeque;

use bytes::Bytes;

use crate::clock::MonoMs;

use super::bitrate_prober::BitrateProber;
use super::client::RtpProbationGenerator;

const MIN_TIMER_INTERVAL_MS: u64 = 5;
const MAX_TIMER_INTERVAL_MS: u64 = 25;
const PACKET_SIZE_SMOOTHING: f64 = 0.95;

#[derive(Clone, Debug)]
pub struct QueuedPacket {
    pub payload: Bytes,
    pub is_padding: bool,
}

struct Budget {
    bytes_remaining: f64,
    rate_bps: f64,
}

impl Budget {
    fn new(rate_bps: f64) -> Self {
        Self {
            bytes_remaining: 0.0,
            rate_bps,
        }
    }

    fn accumulate(&mut self, elapsed_ms: u64) {
        self.bytes_remaining += self.rate_bps / 8.0 * (elapsed_ms as f64 / 1000.0);
    }

    fn consume(&mut self, bytes: usize) {
        self.bytes_remaining -= bytes as f64;
    }

    fn has_budget(&self) -> bool {
        self.bytes_remaining >= 0.0
    }
}

/// Paces queued RTP packets against a media budget and separately against
/// a padding budget, driven by an external caller polling at a cadence
/// this pacer's `next_send_time_ms` recommends.
pub struct PacedSender {
    queue: VecDeque<QueuedPacket>,
    media_budget: Budget,
    padding_budget: Budget,
    prober: BitrateProber,
    probation: RtpProbationGenerator,
    last_update_ms: Option<MonoMs>,
    avg_packet_size_bytes: f64,
}

impl PacedSender {
    #[must_use]
    pub fn new(start_bitrate_bps: f64) -> Self {
        Self {
            queue: VecDeque::new(),
            media_budget: Budget::new(start_bitrate_bps),
            padding_budget: Budget::new(0.0),
            prober: BitrateProber::new(),
            probation: RtpProbationGenerator::new(0),
            last_update_ms: None,
            avg_packet_size_bytes: 1200.0,
        }
    }

    pub fn set_pacing_rates_bps(&mut self, media_rate_bps: f64, padding_rate_bps: f64) {
        self.media_budget.rate_bps = media_rate_bps;
        self.padding_budget.rate_bps = padding_rate_bps;
    }

    pub fn enqueue(&mut self, payload: Bytes) {
        self.avg_packet_size_bytes = PACKET_SIZE_SMOOTHING * self.avg_packet_size_bytes
            + (1.0 - PACKET_SIZE_SMOOTHING) * payload.len() as f64;
        self.queue.push_back(QueuedPacket {
            payload,
            is_padding: false,
        });
    }

    #[must_use]
    pub fn prober_mut(&mut self) -> &mut BitrateProber {
        &mut self.prober
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Advances the token buckets by the elapsed time since the last call
    /// and dequeues packets the media budget can afford.
    pub fn process(&mut self, now_ms: MonoMs) -> Vec<QueuedPacket> {
        let elapsed_ms = self.last_update_ms.map_or(0, |last| now_ms.saturating_sub(last));
        self.last_update_ms = Some(now_ms);
        self.media_budget.accumulate(elapsed_ms);
        self.padding_budget.accumulate(elapsed_ms);

        let mut sent = Vec::new();
        while self.media_budget.has_budget() {
            let Some(packet) = self.queue.pop_front() else {
                break;
            };
            self.media_budget.consume(packet.payload.len());
            if self.prober.is_probing() {
                self.prober.on_packet_sent(now_ms, packet.payload.len() as u32);
            }
            sent.push(packet);
        }

        while self.prober.is_probing() || (self.padding_budget.rate_bps > 0.0 && self.padding_budget.has_budget()) {
            let size_bytes = self
                .prober
                .recommended_probe_size()
                .unwrap_or(self.avg_packet_size_bytes.round() as u32)
                .max(1) as usize;
            let payload = self.probation.generate(size_bytes);
            self.padding_budget.consume(payload.len());
            if self.prober.is_probing() {
                self.prober.on_packet_sent(now_ms, payload.len() as u32);
            }
            sent.push(QueuedPacket {
                payload,
                is_padding: true,
            });
            if !self.prober.is_probing() && !self.padding_budget.has_budget() {
                break;
            }
        }
        sent
    }

    /// Next time this pacer wants a `process` call: the time the media
    /// budget next turns non-negative, clamped to [5ms, 25ms] of "now".
    #[must_use]
    pub fn next_send_time_ms(&self, now_ms: MonoMs) -> MonoMs {
        if let Some(probe_due) = self.prober.next_probe_time_ms(now_ms) {
            return probe_due;
        }
        if self.queue.is_empty() {
            return now_ms.add_ms(MAX_TIMER_INTERVAL_MS);
        }
        if self.media_budget.has_budget() {
            return now_ms.add_ms(MIN_TIMER_INTERVAL_MS);
        }
        let deficit_bytes = -self.media_budget.bytes_remaining;
        let rate_bytes_per_ms = (self.media_budget.rate_bps / 8.0 / 1000.0).max(1.0);
        let wait_ms = (deficit_bytes / rate_bytes_per_ms).ceil() as u64;
        now_ms.add_ms(wait_ms.clamp(MIN_TIMER_INTERVAL_MS, MAX_TIMER_INTERVAL_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_drain_at_configured_rate() {
        let mut pacer = PacedSender::new(1_000_000.0);
        for _ in 0..20 {
            pacer.enqueue(Bytes::from(vec![0u8; 1200]));
        }
        let mut now = MonoMs(0);
        let mut total_sent = 0;
        for _ in 0..50 {
            now = now.add_ms(10);
            total_sent += pacer.process(now).len();
        }
        assert!(total_sent > 0);
        assert!(total_sent <= 20);
    }

    #[test]
    fn empty_queue_backs_off_to_max_interval() {
        let pacer = PacedSender::new(500_000.0);
        let now = MonoMs(0);
        let next = pacer.next_send_time_ms(now);
        assert_eq!(next.0, MAX_TIMER_INTERVAL_MS);
    }

    #[test]
    fn probing_fills_an_empty_queue_with_padding() {
        use super::super::bitrate_prober::ProbeCluster;

        let mut pacer = PacedSender::new(1_000_000.0);
        pacer.prober_mut().create_probe_clusters(&[ProbeCluster {
            id: 1,
            target_bitrate_bps: 1_000_000,
            min_probes: 3,
            min_bytes: 3_000,
        }]);
        let sent = pacer.process(MonoMs(10));
        assert!(sent.iter().all(|p| p.is_padding));
        assert!(!sent.is_empty());
        assert!(!pacer.prober_mut().is_probing());
    }

    #[test]
    fn no_padding_when_idle_and_not_probing() {
        let mut pacer = PacedSender::new(1_000_000.0);
        let sent = pacer.process(MonoMs(10));
        assert!(sent.is_empty());
    }
}
