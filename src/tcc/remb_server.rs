//! Server-side REMB receive estimator: abs-send-time probe clustering
//! feeding a single bandwidth estimate per stream (`spec.md` §4.H).

use std::collections::VecDeque;

use crate::clock::MonoMs;

const PROBE_MAX_COUNT: usize = 15;
const PROBE_MIN_SIZE_BYTES: usize = 200;
const CLUSTER_TIME_DELTA_MS: i64 = 2;
const CLUSTER_SEND_DELTA_MS: i64 = 5;
const MIN_CLUSTER_SIZE: usize = 4;
const BEST_CLUSTER_MIN_DELTA_MS: f64 = -5.0;
const BEST_CLUSTER_MAX_DELTA_MS: f64 = 2.0;
const PROBE_WINDOW_MS: u64 = 2_000;
const STREAM_TIMEOUT_MS: u64 = 2_000;

struct Probe {
    send_ms: i64,
    arrival_ms: i64,
    size_bytes: usize,
}

/// A window of same-size-class probes clustered by ~2.5ms inter-probe
/// spacing, used to estimate available bandwidth from their fan-out.
pub struct RembServer {
    probes: VecDeque<Probe>,
    last_estimate_bps: Option<f64>,
    last_packet_ms: Option<MonoMs>,
    window_start_ms: Option<MonoMs>,
}

impl Default for RembServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RembServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            probes: VecDeque::new(),
            last_estimate_bps: None,
            last_packet_ms: None,
            window_start_ms: None,
        }
    }

    #[must_use]
    pub fn last_estimate_bps(&self) -> Option<f64> {
        self.last_estimate_bps
    }

    /// Feeds one packet's (send time derived from abs-send-time, arrival
    /// time, size). Packets under `PROBE_MIN_SIZE_BYTES` are ignored as
    /// probe candidates, per `spec.md` §4.H.
    pub fn incoming_packet(&mut self, send_ms: i64, arrival_ms: MonoMs, size_bytes: usize) {
        if let Some(last) = self.last_packet_ms {
            if arrival_ms.0.saturating_sub(last.0) > STREAM_TIMEOUT_MS {
                self.probes.clear();
                self.window_start_ms = None;
            }
        }
        self.last_packet_ms = Some(arrival_ms);

        if size_bytes < PROBE_MIN_SIZE_BYTES {
            return;
        }

        self.window_start_ms.get_or_insert(arrival_ms);

        self.probes.push_back(Probe {
            send_ms,
            arrival_ms: arrival_ms.0 as i64,
            size_bytes,
        });
        if self.probes.len() > PROBE_MAX_COUNT {
            self.probes.pop_front();
        }

        let window_open = self.window_start_ms.map_or(false, |start| {
            arrival_ms.saturating_sub(start) >= PROBE_WINDOW_MS
        });
        if window_open || self.last_estimate_bps.is_none() {
            if let Some(estimate) = self.compute_estimate() {
                self.last_estimate_bps = Some(estimate);
            }
            self.window_start_ms = Some(arrival_ms);
        }
    }

    fn compute_estimate(&self) -> Option<f64> {
        let clusters = self.build_clusters();
        let best = self.select_best_cluster(&clusters)?;
        Some(best.bitrate_bps())
    }

    fn build_clusters(&self) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut current: Option<Cluster> = None;
        for probe in &self.probes {
            match &mut current {
                None => {
                    current = Some(Cluster::new(probe));
                }
                Some(c) => {
                    let send_delta = probe.send_ms - c.last_send_ms;
                    if send_delta.abs() <= CLUSTER_SEND_DELTA_MS
                        || (probe.arrival_ms - c.last_arrival_ms).abs() <= CLUSTER_TIME_DELTA_MS
                    {
                        c.extend(probe);
                    } else {
                        clusters.push(current.take().unwrap());
                        current = Some(Cluster::new(probe));
                    }
                }
            }
        }
        if let Some(c) = current {
            clusters.push(c);
        }
        clusters.retain(|c| c.count >= MIN_CLUSTER_SIZE);
        clusters
    }

    fn select_best_cluster<'a>(&self, clusters: &'a [Cluster]) -> Option<&'a Cluster> {
        clusters
            .iter()
            .filter(|c| {
                let mean_delta = c.mean_recv_minus_send_ms();
                mean_delta >= BEST_CLUSTER_MIN_DELTA_MS
                    && mean_delta <= BEST_CLUSTER_MAX_DELTA_MS
                    && c.num_above_min_delta() * 2 > c.count
            })
            .max_by(|a, b| a.bitrate_bps().partial_cmp(&b.bitrate_bps()).unwrap())
    }
}

struct Cluster {
    first_send_ms: i64,
    last_send_ms: i64,
    first_arrival_ms: i64,
    last_arrival_ms: i64,
    total_size_bytes: usize,
    count: usize,
    recv_minus_send_sum_ms: f64,
    above_min_delta: usize,
}

impl Cluster {
    fn new(probe: &Probe) -> Self {
        Self {
            first_send_ms: probe.send_ms,
            last_send_ms: probe.send_ms,
            first_arrival_ms: probe.arrival_ms,
            last_arrival_ms: probe.arrival_ms,
            total_size_bytes: probe.size_bytes,
            count: 1,
            recv_minus_send_sum_ms: 0.0,
            above_min_delta: 0,
        }
    }

    fn extend(&mut self, probe: &Probe) {
        let delta_ms = (probe.arrival_ms - self.last_arrival_ms) as f64
            - (probe.send_ms - self.last_send_ms) as f64;
        self.recv_minus_send_sum_ms += delta_ms;
        if delta_ms >= 0.0 {
            self.above_min_delta += 1;
        }
        self.last_send_ms = probe.send_ms;
        self.last_arrival_ms = probe.arrival_ms;
        self.total_size_bytes += probe.size_bytes;
        self.count += 1;
    }

    fn mean_recv_minus_send_ms(&self) -> f64 {
        if self.count <= 1 {
            0.0
        } else {
            self.recv_minus_send_sum_ms / (self.count - 1) as f64
        }
    }

    fn num_above_min_delta(&self) -> usize {
        self.above_min_delta
    }

    fn bitrate_bps(&self) -> f64 {
        let send_span_ms = (self.last_send_ms - self.first_send_ms).max(1) as f64;
        let arrival_span_ms = (self.last_arrival_ms - self.first_arrival_ms).max(1) as f64;
        let span_ms = send_span_ms.max(arrival_span_ms);
        (self.total_size_bytes as f64 * 8.0) / (span_ms / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_probe_train_yields_positive_estimate() {
        let mut server = RembServer::new();
        let mut now = MonoMs(0);
        for i in 0..10 {
            server.incoming_packet(i * 5, now, 1200);
            now = now.add_ms(5);
        }
        assert!(server.last_estimate_bps().is_some());
        assert!(server.last_estimate_bps().unwrap() > 0.0);
    }

    #[test]
    fn small_packets_are_not_probe_candidates() {
        let mut server = RembServer::new();
        let mut now = MonoMs(0);
        for i in 0..10 {
            server.incoming_packet(i * 5, now, 100);
            now = now.add_ms(5);
        }
        assert!(server.probes.is_empty());
    }

    #[test]
    fn stream_timeout_clears_probe_history() {
        let mut server = RembServer::new();
        server.incoming_packet(0, MonoMs(0), 1200);
        server.incoming_packet(5, MonoMs(5), 1200);
        assert_eq!(server.probes.len(), 2);
        server.incoming_packet(10, MonoMs(5).add_ms(STREAM_TIMEOUT_MS + 1), 1200);
        assert_eq!(server.probes.len(), 1);
    }
}
