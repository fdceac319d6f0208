//! Shared statistics-snapshot contract: every component exposes a
//! `dump()`/`get_stats(now_ms)` pair returning a structured snapshot
//! (`spec.md` §6 "Outbound stats").

use crate::clock::MonoMs;

/// Implemented by every stateful component that the orchestrator polls
/// for statistics. `Snapshot` is the component's own stats struct; kept
/// as an associated type so each component's snapshot carries only the
/// fields meaningful to it instead of one bloated union.
pub trait StatsSource {
    type Snapshot;

    /// A snapshot reflecting state as of the last processed event, with
    /// no time-dependent fields recomputed (cheap, always available).
    fn dump(&self) -> Self::Snapshot;

    /// A snapshot with time-dependent fields (rates, elapsed durations)
    /// recomputed against `now_ms`.
    fn get_stats(&mut self, now_ms: MonoMs) -> Self::Snapshot;
}

/// Byte/packet counters shared by every RTP-carrying component's stats
/// struct (retransmission buffer, NACK generator, TCC server).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketCounters {
    pub packets: u64,
    pub bytes: u64,
}

impl PacketCounters {
    pub fn record(&mut self, bytes: u64) {
        self.packets += 1;
        self.bytes += bytes;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RetransmissionBufferStats {
    pub counters: PacketCounters,
    pub items_present: usize,
    pub oldest_seq: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NackGeneratorStats {
    pub nacks_sent: u64,
    pub nacks_recovered: u64,
    pub pending: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IceServerStats {
    pub tuples: usize,
    pub bytes_received: u64,
    pub consent_requests_sent: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TccClientStats {
    pub available_bitrate_bps: f64,
    pub loss_fraction: f64,
    pub rtt_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut counters = PacketCounters::default();
        counters.record(1200);
        counters.record(300);
        assert_eq!(counters.packets, 2);
        assert_eq!(counters.bytes, 1500);
    }
}
