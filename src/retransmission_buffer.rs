//! Bounded, time-and-sequence-ordered RTP packet store serving RTX replies
//! (`spec.md` §4.C).

use bytes::Bytes;

use crate::clock::MonoMs;
use crate::rtp::packet::{is_seq_higher_than, is_ts_higher_than};

/// One stored RTP packet plus the bookkeeping the retransmission path needs.
#[derive(Clone, Debug)]
pub struct Item {
    pub packet: Bytes,
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub resent_at_ms: Option<MonoMs>,
    pub sent_times: u32,
}

impl Item {
    fn new(packet: Bytes, ssrc: u32, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            packet,
            ssrc,
            sequence_number,
            timestamp,
            resent_at_ms: None,
            sent_times: 0,
        }
    }
}

fn too_old(ts: u32, newest_ts: u32, clock_rate: u32, max_retransmission_delay_ms: u64) -> bool {
    if !is_ts_higher_than(newest_ts, ts) && newest_ts != ts {
        return false;
    }
    let delta_ts = newest_ts.wrapping_sub(ts) as u64;
    delta_ts * 1000 / clock_rate as u64 > max_retransmission_delay_ms
}

/// `slots[i]` holds the item whose sequence number is `oldest_seq + i`, or
/// `None` for a blank slot. `slots.front()`/`slots.back()` are always
/// present whenever the buffer is non-empty.
pub struct RetransmissionBuffer {
    max_items: usize,
    clock_rate: u32,
    max_retransmission_delay_ms: u64,
    slots: std::collections::VecDeque<Option<Item>>,
    oldest_seq: u16,
}

impl RetransmissionBuffer {
    #[must_use]
    pub fn new(max_items: usize, clock_rate: u32, max_retransmission_delay_ms: u64) -> Self {
        Self {
            max_items,
            clock_rate,
            max_retransmission_delay_ms,
            slots: std::collections::VecDeque::new(),
            oldest_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Present items only, oldest first.
    pub fn present_items(&self) -> impl Iterator<Item = &Item> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    fn newest(&self) -> Option<&Item> {
        self.slots.back().and_then(|s| s.as_ref())
    }

    fn oldest(&self) -> Option<&Item> {
        self.slots.front().and_then(|s| s.as_ref())
    }

    fn clear_and_insert(&mut self, packet: Bytes, ssrc: u32, seq: u16, ts: u32) {
        self.slots.clear();
        self.slots.push_back(Some(Item::new(packet, ssrc, seq, ts)));
        self.oldest_seq = seq;
    }

    fn evict_too_old_from_front(&mut self, effective_newest_ts: u32) {
        while let Some(front) = self.oldest() {
            if too_old(
                front.timestamp,
                effective_newest_ts,
                self.clock_rate,
                self.max_retransmission_delay_ms,
            ) {
                self.slots.pop_front();
                self.oldest_seq = self.oldest_seq.wrapping_add(1);
            } else {
                break;
            }
        }
    }

    pub fn get(&self, seq: u16) -> Option<&Item> {
        let offset = seq.wrapping_sub(self.oldest_seq) as usize;
        if offset >= self.slots.len() {
            return None;
        }
        self.slots.get(offset).and_then(|s| s.as_ref())
    }

    /// Inserts a newly received RTP packet into the buffer, per `spec.md`
    /// §4.C's five-case algorithm.
    pub fn insert(&mut self, packet: Bytes, ssrc: u32, seq: u16, ts: u32) {
        let Some(newest) = self.newest() else {
            self.slots.push_back(Some(Item::new(packet, ssrc, seq, ts)));
            self.oldest_seq = seq;
            return;
        };
        let newest_seq = newest.sequence_number;
        let newest_ts = newest.timestamp;

        if is_seq_higher_than(newest_seq, seq) && is_ts_higher_than(ts, newest_ts) {
            // Newer timestamp but lower sequence number: the stream
            // restarted (e.g. an SSRC/seq reset). Start fresh.
            self.clear_and_insert(packet, ssrc, seq, ts);
            return;
        }

        let effective_newest_ts = if is_ts_higher_than(ts, newest_ts) { ts } else { newest_ts };
        self.evict_too_old_from_front(effective_newest_ts);

        let Some(newest) = self.newest() else {
            self.clear_and_insert(packet, ssrc, seq, ts);
            return;
        };
        let newest_seq = newest.sequence_number;
        let newest_ts = newest.timestamp;
        let oldest_seq = self.oldest_seq;

        if is_seq_higher_than(seq, newest_seq) {
            if is_ts_higher_than(newest_ts, ts) {
                // Newer sequence must carry a non-decreasing timestamp.
                return;
            }
            let blank_slots = seq.wrapping_sub(newest_seq).wrapping_sub(1) as usize;
            let would_be_len = self.slots.len() + blank_slots + 1;
            if would_be_len > self.max_items {
                let overflow = would_be_len - self.max_items;
                for _ in 0..overflow.min(self.slots.len()) {
                    self.slots.pop_front();
                    self.oldest_seq = self.oldest_seq.wrapping_add(1);
                }
                if self.slots.len() + blank_slots + 1 > self.max_items {
                    self.clear_and_insert(packet, ssrc, seq, ts);
                    return;
                }
            }
            for _ in 0..blank_slots {
                self.slots.push_back(None);
            }
            self.slots.push_back(Some(Item::new(packet, ssrc, seq, ts)));
            return;
        }

        if is_seq_higher_than(oldest_seq, seq) {
            let Some(oldest) = self.oldest() else { return };
            if is_ts_higher_than(ts, oldest.timestamp) {
                return;
            }
            if too_old(ts, effective_newest_ts, self.clock_rate, self.max_retransmission_delay_ms) {
                return;
            }
            let front_blanks = oldest_seq.wrapping_sub(seq).wrapping_sub(1) as usize;
            if self.slots.len() + front_blanks + 1 > self.max_items {
                return;
            }
            for _ in 0..front_blanks {
                self.slots.push_front(None);
            }
            self.slots.push_front(Some(Item::new(packet, ssrc, seq, ts)));
            self.oldest_seq = seq;
            return;
        }

        // Between oldest and newest: fill an existing slot.
        let offset = seq.wrapping_sub(oldest_seq) as usize;
        if offset >= self.slots.len() {
            return;
        }
        if self.slots[offset].is_some() {
            return; // duplicate
        }
        let mut lower_ts = None;
        for i in (0..offset).rev() {
            if let Some(item) = &self.slots[i] {
                lower_ts = Some(item.timestamp);
                break;
            }
        }
        let mut upper_ts = None;
        for i in offset + 1..self.slots.len() {
            if let Some(item) = &self.slots[i] {
                upper_ts = Some(item.timestamp);
                break;
            }
        }
        if let Some(lo) = lower_ts {
            if is_ts_higher_than(lo, ts) {
                return;
            }
        }
        if let Some(hi) = upper_ts {
            if is_ts_higher_than(ts, hi) {
                return;
            }
        }
        self.slots[offset] = Some(Item::new(packet, ssrc, seq, ts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt() -> Bytes {
        Bytes::from_static(b"x")
    }

    #[test]
    fn stream_restart_clears_buffer() {
        // spec.md §8 scenario 3.
        let mut buf = RetransmissionBuffer::new(4, 90_000, 2_000);
        buf.insert(pkt(), 1, 30001, 3_000_000_000);
        buf.insert(pkt(), 1, 30002, 3_000_000_000);
        buf.insert(pkt(), 1, 30003, 3_000_000_200);
        buf.insert(pkt(), 1, 40000, 3_000_003_000);
        let items: Vec<_> = buf.present_items().map(|i| (i.sequence_number, i.timestamp)).collect();
        assert_eq!(items, vec![(40000, 3_000_003_000)]);
    }

    #[test]
    fn blank_slots_and_ordering() {
        // spec.md §8 scenario 4.
        let mut buf = RetransmissionBuffer::new(10, 90_000, 1_000_000);
        buf.insert(pkt(), 1, 40002, 4_000_000_002);
        buf.insert(pkt(), 1, 40003, 4_000_000_001); // discarded: timestamp regression
        buf.insert(pkt(), 1, 40004, 4_000_000_004);
        buf.insert(pkt(), 1, 40002, 4_000_000_002); // discarded: duplicate
        buf.insert(pkt(), 1, 40008, 4_000_000_008);
        buf.insert(pkt(), 1, 40006, 4_000_000_006);
        buf.insert(pkt(), 1, 40000, 4_000_000_000);

        assert_eq!(buf.len(), 9);
        let present: Vec<usize> = buf
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        assert_eq!(present, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn ordering_invariant_holds_after_inserts() {
        let mut buf = RetransmissionBuffer::new(8, 90_000, 1_000_000);
        for (seq, ts) in [(10u16, 100u32), (11, 100), (13, 130), (12, 120)] {
            buf.insert(pkt(), 1, seq, ts);
        }
        let items: Vec<_> = buf.present_items().collect();
        for w in items.windows(2) {
            assert!(!is_ts_higher_than(w[0].timestamp, w[1].timestamp));
            assert!(is_seq_higher_than(w[1].sequence_number, w[0].sequence_number));
        }
    }
}
