//! Bitrate probing clusters: bursts of packets sent back-to-back at a
//! target rate so the receiver's `RembServer`/TCC feedback can measure the
//! achievable throughput (`spec.md` §4.K).

use crate::clock::MonoMs;

#[derive(Clone, Copy, Debug)]
pub struct ProbeCluster {
    pub id: u16,
    pub target_bitrate_bps: u64,
    pub min_probes: u32,
    pub min_bytes: u32,
}

struct ActiveCluster {
    cluster: ProbeCluster,
    sent_probes: u32,
    sent_bytes: u32,
}

/// Queues probe clusters and paces their packets at the cluster's target
/// bitrate, independent of the media send queue.
pub struct BitrateProber {
    queue: Vec<ProbeCluster>,
    active: Option<ActiveCluster>,
    next_probe_ms: Option<MonoMs>,
}

impl Default for BitrateProber {
    fn default() -> Self {
        Self::new()
    }
}

impl BitrateProber {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            active: None,
            next_probe_ms: None,
        }
    }

    /// `create_probe_clusters`: queues a cluster targeting `bitrate_bps`,
    /// requiring at least `min_probes` packets and `min_bytes` total.
    pub fn create_probe_clusters(&mut self, clusters: &[ProbeCluster]) {
        self.queue.extend_from_slice(clusters);
    }

    #[must_use]
    pub fn is_probing(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    /// Recommended size in bytes for the next probe packet: the active
    /// cluster's remaining bytes spread over its remaining probes, or the
    /// next queued cluster's average probe size if none is active yet.
    #[must_use]
    pub fn recommended_probe_size(&self) -> Option<u32> {
        if let Some(active) = &self.active {
            let remaining_probes = active.cluster.min_probes.saturating_sub(active.sent_probes).max(1);
            let remaining_bytes = active.cluster.min_bytes.saturating_sub(active.sent_bytes);
            Some((remaining_bytes / remaining_probes).max(1))
        } else {
            self.queue
                .first()
                .map(|cluster| (cluster.min_bytes / cluster.min_probes.max(1)).max(1))
        }
    }

    /// Time of the next packet this prober wants to send, if any.
    #[must_use]
    pub fn next_probe_time_ms(&self, now_ms: MonoMs) -> Option<MonoMs> {
        if self.active.is_none() && self.queue.is_empty() {
            return None;
        }
        Some(self.next_probe_ms.unwrap_or(now_ms))
    }

    /// Called when the pacer is about to send a packet of `size_bytes`
    /// while probing is active; returns the probe cluster id it counts
    /// against, if probing should inject this send.
    pub fn on_packet_sent(&mut self, now_ms: MonoMs, size_bytes: u32) -> Option<u16> {
        if self.active.is_none() {
            if self.queue.is_empty() {
                return None;
            }
            let cluster = self.queue.remove(0);
            self.active = Some(ActiveCluster {
                cluster,
                sent_probes: 0,
                sent_bytes: 0,
            });
        }

        let cluster_id = {
            let active = self.active.as_mut().unwrap();
            active.sent_probes += 1;
            active.sent_bytes += size_bytes;
            active.cluster.id
        };

        let done = {
            let active = self.active.as_ref().unwrap();
            active.sent_probes >= active.cluster.min_probes && active.sent_bytes >= active.cluster.min_bytes
        };

        if done {
            self.active = None;
            self.next_probe_ms = None;
        } else {
            let active = self.active.as_ref().unwrap();
            let bytes_per_ms = active.cluster.target_bitrate_bps as f64 / 8.0 / 1000.0;
            let interval_ms = if bytes_per_ms > 0.0 {
                (size_bytes as f64 / bytes_per_ms).round() as u64
            } else {
                1
            };
            self.next_probe_ms = Some(now_ms.add_ms(interval_ms.max(1)));
        }

        Some(cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_completes_after_min_probes_and_bytes() {
        let mut prober = BitrateProber::new();
        prober.create_probe_clusters(&[ProbeCluster {
            id: 1,
            target_bitrate_bps: 1_000_000,
            min_probes: 3,
            min_bytes: 3000,
        }]);
        assert!(prober.is_probing());
        let mut now = MonoMs(0);
        for _ in 0..3 {
            let id = prober.on_packet_sent(now, 1200);
            assert_eq!(id, Some(1));
            now = now.add_ms(1);
        }
        assert!(!prober.is_probing());
    }

    #[test]
    fn no_probe_when_queue_empty() {
        let mut prober = BitrateProber::new();
        assert_eq!(prober.on_packet_sent(MonoMs(0), 1200), None);
    }

    #[test]
    fn recommended_size_tracks_the_active_cluster() {
        let mut prober = BitrateProber::new();
        prober.create_probe_clusters(&[ProbeCluster {
            id: 1,
            target_bitrate_bps: 1_000_000,
            min_probes: 2,
            min_bytes: 2000,
        }]);
        assert_eq!(prober.recommended_probe_size(), Some(1000));
        prober.on_packet_sent(MonoMs(0), 1000);
        assert_eq!(prober.recommended_probe_size(), Some(1000));
    }

    #[test]
    fn recommended_size_is_none_when_idle() {
        let prober = BitrateProber::new();
        assert_eq!(prober.recommended_probe_size(), None);
    }
}
