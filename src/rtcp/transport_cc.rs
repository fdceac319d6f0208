//! RTPFB fmt=15 Transport-Wide Congestion Control feedback, serialized per
//! draft-holmer-rmcat-transport-wide-cc-extensions-01 (`spec.md` §6).
//!
//! Status symbols are packed into run-length chunks only: any sequence of
//! receive/not-receive flags can be expressed as a series of runs, so this
//! crate never needs the more compact two-bit vector chunk to *produce* a
//! valid packet. Parsing still understands vector chunks, since a feedback
//! packet arriving from elsewhere in a real deployment may use them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::header::{self, FeedbackHeader, FMT_TCC, PT_RTPFB};
use crate::error::MalformedPacket;

const TICK_US: i64 = 250;
const REFERENCE_TIME_UNIT_MS: i64 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Symbol {
    NotReceived,
    SmallDelta,
    LargeDelta,
}

impl Symbol {
    fn bits(self) -> u16 {
        match self {
            Self::NotReceived => 0,
            Self::SmallDelta => 1,
            Self::LargeDelta => 2,
        }
    }
}

/// One logical entry in a transport-cc feedback: a wide sequence number and
/// whether/when it was seen to arrive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TccEntry {
    pub wide_seq: u16,
    pub arrival_ms: Option<i64>,
}

/// A fully decoded/about-to-be-encoded transport-cc feedback packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TccFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fb_pkt_count: u8,
    pub entries: Vec<TccEntry>,
}

fn delta_ticks(from_ms: i64, to_ms: i64) -> i64 {
    (to_ms - from_ms) * 1000 / TICK_US
}

#[must_use]
pub fn encode(feedback: &TccFeedback) -> Bytes {
    let base_seq = feedback
        .entries
        .first()
        .map_or(0, |e| e.wide_seq);
    let status_count = feedback.entries.len() as u16;
    let reference_arrival = feedback
        .entries
        .iter()
        .find_map(|e| e.arrival_ms)
        .unwrap_or(0);
    let reference_time_units = reference_arrival / REFERENCE_TIME_UNIT_MS;
    let reference_time_ms = reference_time_units * REFERENCE_TIME_UNIT_MS;

    let mut buf = BytesMut::new();
    let hdr_off = header::write_feedback_header(
        &mut buf,
        FMT_TCC,
        PT_RTPFB,
        feedback.sender_ssrc,
        feedback.media_ssrc,
    );
    buf.put_u16(base_seq);
    buf.put_u16(status_count);
    buf.put_u8(((reference_time_units >> 16) & 0xFF) as u8);
    buf.put_u8(((reference_time_units >> 8) & 0xFF) as u8);
    buf.put_u8((reference_time_units & 0xFF) as u8);
    buf.put_u8(feedback.fb_pkt_count);

    // Run-length-encode the symbol stream.
    let symbols: Vec<Symbol> = {
        let mut last_arrival_ms = reference_time_ms;
        feedback
            .entries
            .iter()
            .map(|e| match e.arrival_ms {
                None => Symbol::NotReceived,
                Some(t) => {
                    let ticks = delta_ticks(last_arrival_ms, t);
                    last_arrival_ms = t;
                    if (0..=255).contains(&ticks) {
                        Symbol::SmallDelta
                    } else {
                        Symbol::LargeDelta
                    }
                }
            })
            .collect()
    };
    let mut i = 0;
    while i < symbols.len() {
        let sym = symbols[i];
        let mut run = 1usize;
        while i + run < symbols.len() && symbols[i + run] == sym && run < 0x1FFF {
            run += 1;
        }
        // T=0 (bit 15), symbol (bits 14-13), run length (bits 12-0).
        let chunk: u16 = (sym.bits() << 13) | (run as u16 & 0x1FFF);
        buf.put_u16(chunk);
        i += run;
    }

    // Recv deltas, in the same order as the symbol stream.
    let mut last_arrival_ms = reference_time_ms;
    for entry in &feedback.entries {
        if let Some(t) = entry.arrival_ms {
            let ticks = delta_ticks(last_arrival_ms, t);
            last_arrival_ms = t;
            if (0..=255).contains(&ticks) {
                buf.put_u8(ticks as u8);
            } else {
                buf.put_i16(ticks.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
            }
        }
    }

    // RTCP packets are padded to a 32-bit boundary.
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
    let total = buf.len();
    header::patch_length(&mut buf, hdr_off, total);
    buf.freeze()
}

pub fn decode(buf: &[u8]) -> Result<TccFeedback, MalformedPacket> {
    let (hdr, mut body) = FeedbackHeader::parse(buf)?;
    if hdr.fmt != FMT_TCC || hdr.packet_type != PT_RTPFB {
        return Err(MalformedPacket::new("not an RTPFB transport-cc packet"));
    }
    if body.len() < 8 {
        return Err(MalformedPacket::new("transport-cc header truncated"));
    }
    let base_seq = u16::from_be_bytes([body[0], body[1]]);
    let status_count = u16::from_be_bytes([body[2], body[3]]) as usize;
    let reference_time_units = ((body[4] as i64) << 16) | ((body[5] as i64) << 8) | body[6] as i64;
    let reference_time_ms = reference_time_units * REFERENCE_TIME_UNIT_MS;
    let fb_pkt_count = body[7];
    body = &body[8..];

    let mut symbols = Vec::with_capacity(status_count);
    while symbols.len() < status_count {
        if body.len() < 2 {
            return Err(MalformedPacket::new("transport-cc chunk list truncated"));
        }
        let chunk = u16::from_be_bytes([body[0], body[1]]);
        body = &body[2..];
        if chunk & 0x8000 == 0 {
            // Run-length chunk.
            let sym_bits = (chunk >> 13) & 0b11;
            let run = (chunk & 0x1FFF) as usize;
            let sym = match sym_bits {
                0 => Symbol::NotReceived,
                1 => Symbol::SmallDelta,
                2 => Symbol::LargeDelta,
                _ => return Err(MalformedPacket::new("reserved transport-cc symbol")),
            };
            for _ in 0..run {
                if symbols.len() >= status_count {
                    break;
                }
                symbols.push(sym);
            }
        } else {
            // Status vector chunk.
            let two_bit = chunk & 0x4000 != 0;
            if two_bit {
                for shift in (0..14).step_by(2).rev() {
                    if symbols.len() >= status_count {
                        break;
                    }
                    let bits = (chunk >> shift) & 0b11;
                    let sym = match bits {
                        0 => Symbol::NotReceived,
                        1 => Symbol::SmallDelta,
                        2 => Symbol::LargeDelta,
                        _ => return Err(MalformedPacket::new("reserved transport-cc symbol")),
                    };
                    symbols.push(sym);
                }
            } else {
                for shift in (0..14).rev() {
                    if symbols.len() >= status_count {
                        break;
                    }
                    let bit = (chunk >> shift) & 0b1;
                    symbols.push(if bit == 0 {
                        Symbol::NotReceived
                    } else {
                        Symbol::SmallDelta
                    });
                }
            }
        }
    }

    let mut entries = Vec::with_capacity(status_count);
    let mut last_arrival_ms = reference_time_ms;
    let mut cursor = body;
    for (i, sym) in symbols.into_iter().enumerate() {
        let wide_seq = base_seq.wrapping_add(i as u16);
        let arrival_ms = match sym {
            Symbol::NotReceived => None,
            Symbol::SmallDelta => {
                if cursor.is_empty() {
                    return Err(MalformedPacket::new("transport-cc deltas truncated"));
                }
                let ticks = cursor.get_u8() as i64;
                last_arrival_ms += ticks * TICK_US / 1000;
                Some(last_arrival_ms)
            }
            Symbol::LargeDelta => {
                if cursor.len() < 2 {
                    return Err(MalformedPacket::new("transport-cc deltas truncated"));
                }
                let ticks = cursor.get_i16() as i64;
                last_arrival_ms += ticks * TICK_US / 1000;
                Some(last_arrival_ms)
            }
        };
        entries.push(TccEntry {
            wide_seq,
            arrival_ms,
        });
    }

    Ok(TccFeedback {
        sender_ssrc: hdr.sender_ssrc,
        media_ssrc: hdr.media_ssrc,
        fb_pkt_count,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u16, arrival_ms: Option<i64>) -> TccEntry {
        TccEntry {
            wide_seq: seq,
            arrival_ms,
        }
    }

    #[test]
    fn round_trips_received_and_missing_entries() {
        let fb = TccFeedback {
            sender_ssrc: 0,
            media_ssrc: 1234,
            fb_pkt_count: 5,
            entries: vec![
                entry(3, None),
                entry(4, Some(1100)),
                entry(5, Some(1150)),
            ],
        };
        let encoded = encode(&fb);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.media_ssrc, 1234);
        assert_eq!(decoded.fb_pkt_count, 5);
        assert_eq!(decoded.entries, fb.entries);
    }

    #[test]
    fn out_of_order_scenario_from_spec() {
        // spec.md §8 scenario 5, second feedback: {3: not-recv, 4, 5}.
        let fb = TccFeedback {
            sender_ssrc: 0,
            media_ssrc: 9,
            fb_pkt_count: 1,
            entries: vec![entry(3, None), entry(4, Some(1100)), entry(5, Some(1150))],
        };
        let decoded = decode(&encode(&fb)).unwrap();
        assert_eq!(decoded.entries, fb.entries);
    }

    #[test]
    fn large_delta_round_trips() {
        let fb = TccFeedback {
            sender_ssrc: 0,
            media_ssrc: 1,
            fb_pkt_count: 0,
            entries: vec![entry(1, Some(0)), entry(2, Some(500))],
        };
        let decoded = decode(&encode(&fb)).unwrap();
        assert_eq!(decoded.entries[0].arrival_ms, Some(0));
        assert_eq!(decoded.entries[1].arrival_ms, Some(500));
    }
}
