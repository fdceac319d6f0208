//! Server-side transport-wide congestion control feedback producer
//! (`spec.md` §4.G).

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::clock::MonoMs;
use crate::rtcp::{self, TccEntry, TccFeedback};

const FLUSH_PERIOD_MS: u64 = 100;
const MAX_FEEDBACK_BYTES: usize = 1200;
const MAX_ENTRIES_PER_FEEDBACK: usize = 8_000; // stays comfortably under the 0x1FFF RLE run-length cap.

/// Accumulates (wide_seq, arrival_ms) pairs from incoming RTP packets and
/// periodically serializes them into `transport-cc` RTCP feedback packets.
///
/// Re-basing after a flush follows `spec.md` §4.G/§8 scenario 5: if the
/// just-flushed range contained a sequence never marked received, the next
/// feedback reopens at that sequence and carries forward every entry from
/// there on (including ones already reported received), rather than
/// starting from an empty window. Otherwise the next feedback starts
/// clean at `max_seq + 1`.
pub struct TccServer {
    entries: BTreeMap<u32, Option<i64>>,
    base_seq: Option<u32>,
    max_seq: u32,
    window_start_ms: Option<MonoMs>,
    feedback_packet_count: u8,
    latest_media_ssrc: u32,
}

impl Default for TccServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TccServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            base_seq: None,
            max_seq: 0,
            window_start_ms: None,
            feedback_packet_count: 0,
            latest_media_ssrc: 0,
        }
    }

    /// Records a received RTP packet's extended wide sequence number and
    /// arrival time. `now_ms` drives the 100ms periodic flush; returns a
    /// serialized feedback packet if recording this packet required one.
    pub fn incoming_packet(&mut self, wide_seq: u32, arrival_ms: MonoMs, media_ssrc: u32) -> Option<Bytes> {
        self.latest_media_ssrc = media_ssrc;

        let due = self
            .window_start_ms
            .map_or(false, |start| arrival_ms.saturating_sub(start) >= FLUSH_PERIOD_MS);
        let over_capacity = self.entries.len() >= MAX_ENTRIES_PER_FEEDBACK;
        let mut flushed = None;
        if due || over_capacity {
            flushed = self.flush();
        }

        match self.base_seq {
            None => {
                self.base_seq = Some(wide_seq);
                self.max_seq = wide_seq;
                self.entries.insert(wide_seq, Some(arrival_ms.0 as i64));
                self.window_start_ms = Some(arrival_ms);
            }
            Some(base) => {
                if wide_seq < base {
                    // Arrived older than the current window's base; ignore
                    // for feedback purposes (already reported or expired).
                    return flushed;
                }
                if wide_seq > self.max_seq {
                    for gap in (self.max_seq + 1)..wide_seq {
                        self.entries.entry(gap).or_insert(None);
                    }
                    self.max_seq = wide_seq;
                }
                self.entries.insert(wide_seq, Some(arrival_ms.0 as i64));
                if self.window_start_ms.is_none() {
                    self.window_start_ms = Some(arrival_ms);
                }
            }
        }

        // Estimate whether the current window would exceed the MTU if
        // serialized now; if so, flush what we have before returning.
        if self.estimated_size_bytes() > MAX_FEEDBACK_BYTES {
            let extra = self.flush();
            return extra.or(flushed);
        }

        flushed
    }

    fn estimated_size_bytes(&self) -> usize {
        16 + self.entries.len() * 2
    }

    /// Force-serializes whatever is currently pending, even if the 100ms
    /// period has not elapsed. Used by callers that need to flush on
    /// shutdown or explicit request.
    pub fn flush_now(&mut self) -> Option<Bytes> {
        self.flush()
    }

    fn flush(&mut self) -> Option<Bytes> {
        let base_seq = self.base_seq?;
        if self.entries.is_empty() {
            return None;
        }

        let tcc_entries: Vec<TccEntry> = self
            .entries
            .iter()
            .map(|(seq, arrival)| TccEntry {
                wide_seq: *seq as u16,
                arrival_ms: *arrival,
            })
            .collect();

        let feedback = TccFeedback {
            sender_ssrc: 0,
            media_ssrc: self.latest_media_ssrc,
            fb_pkt_count: self.feedback_packet_count,
            entries: tcc_entries,
        };
        self.feedback_packet_count = self.feedback_packet_count.wrapping_add(1);
        let packet = rtcp::encode_tcc_feedback(&feedback);

        let not_received: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, arrival)| arrival.is_none())
            .map(|(seq, _)| *seq)
            .collect();

        match not_received.first() {
            Some(&new_base) => {
                self.entries.retain(|seq, _| *seq >= new_base);
                self.base_seq = Some(new_base);
            }
            None => {
                self.entries.clear();
                self.base_seq = Some(self.max_seq + 1);
            }
        }
        self.window_start_ms = None;

        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(server: &mut TccServer, seq: u32, ms: u64) -> Option<TccFeedback> {
        server
            .incoming_packet(seq, MonoMs(ms), 1)
            .map(|b| rtcp::decode_tcc_feedback(&b).unwrap())
    }

    #[test]
    fn out_of_order_scenario_produces_exact_three_feedbacks() {
        let mut server = TccServer::new();
        let mut outputs = Vec::new();

        outputs.extend(feed(&mut server, 1, 1000));
        outputs.extend(feed(&mut server, 2, 1050));
        outputs.extend(feed(&mut server, 4, 1100));
        outputs.extend(feed(&mut server, 5, 1150));
        outputs.extend(feed(&mut server, 3, 1200));
        outputs.extend(feed(&mut server, 6, 1250));
        if let Some(last) = server.flush_now() {
            outputs.push(rtcp::decode_tcc_feedback(&last).unwrap());
        }

        assert_eq!(outputs.len(), 3);

        let seqs = |fb: &TccFeedback| -> Vec<(u16, Option<i64>)> {
            fb.entries.iter().map(|e| (e.wide_seq, e.arrival_ms)).collect()
        };
        assert_eq!(seqs(&outputs[0]), vec![(1, Some(1000)), (2, Some(1050))]);
        assert_eq!(
            seqs(&outputs[1]),
            vec![(3, None), (4, Some(1100)), (5, Some(1150))]
        );
        assert_eq!(
            seqs(&outputs[2]),
            vec![(3, Some(1200)), (4, Some(1100)), (5, Some(1150)), (6, Some(1250))]
        );
    }

    #[test]
    fn feedback_packet_count_is_monotonic() {
        let mut server = TccServer::new();
        feed(&mut server, 1, 0);
        feed(&mut server, 2, 10);
        let fb1 = feed(&mut server, 3, 150).unwrap();
        feed(&mut server, 4, 160);
        let fb2 = feed(&mut server, 5, 300).unwrap();
        assert_eq!(fb2.fb_pkt_count, fb1.fb_pkt_count.wrapping_add(1));
    }
}
