//! RTPFB fmt=1 Generic NACK (RFC 4585 §6.2.1).
//!
//! Feedback control information is a list of (PID, BLP) pairs: a base
//! sequence number plus a 16-bit bitmask of up to 16 further lost packets
//! immediately following it.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{self, FeedbackHeader, FMT_NACK, PT_RTPFB};
use crate::error::MalformedPacket;

/// Builds one or more RTPFB NACK packets carrying `seqs` (must already be
/// deduplicated and need not be sorted, though sorted input packs more
/// tightly into PID/BLP pairs). Splits into multiple packets if the gaps
/// between consecutive sequence numbers exceed what a single BLP can
/// express.
#[must_use]
pub fn build_nack_packets(sender_ssrc: u32, media_ssrc: u32, seqs: &[u16]) -> Vec<Bytes> {
    if seqs.is_empty() {
        return Vec::new();
    }
    let mut sorted = seqs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut packets = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let base = sorted[i];
        let mut blp: u16 = 0;
        let mut j = i + 1;
        while j < sorted.len() {
            let delta = sorted[j].wrapping_sub(base);
            if delta == 0 || delta > 16 {
                break;
            }
            blp |= 1 << (delta - 1);
            j += 1;
        }
        i = j;

        let mut buf = BytesMut::new();
        let off = header::write_feedback_header(&mut buf, FMT_NACK, PT_RTPFB, sender_ssrc, media_ssrc);
        buf.put_u16(base);
        buf.put_u16(blp);
        let total = buf.len();
        header::patch_length(&mut buf, off, total);
        packets.push(buf.freeze());
    }
    packets
}

/// Parses one RTPFB NACK packet's FCI list into the set of lost sequence
/// numbers it names.
pub fn parse_nack_packet(buf: &[u8]) -> Result<(u32, u32, Vec<u16>), MalformedPacket> {
    let (hdr, body) = FeedbackHeader::parse(buf)?;
    if hdr.fmt != FMT_NACK || hdr.packet_type != PT_RTPFB {
        return Err(MalformedPacket::new("not an RTPFB Generic NACK packet"));
    }
    if body.len() % 4 != 0 {
        return Err(MalformedPacket::new("NACK FCI length not a multiple of 4"));
    }
    let mut seqs = Vec::new();
    for chunk in body.chunks_exact(4) {
        let pid = u16::from_be_bytes([chunk[0], chunk[1]]);
        let blp = u16::from_be_bytes([chunk[2], chunk[3]]);
        seqs.push(pid);
        for bit in 0..16 {
            if blp & (1 << bit) != 0 {
                seqs.push(pid.wrapping_add(bit + 1));
            }
        }
    }
    Ok((hdr.sender_ssrc, hdr.media_ssrc, seqs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_gap() {
        let packets = build_nack_packets(1, 2, &[2382]);
        assert_eq!(packets.len(), 1);
        let (ssrc, media, seqs) = parse_nack_packet(&packets[0]).unwrap();
        assert_eq!(ssrc, 1);
        assert_eq!(media, 2);
        assert_eq!(seqs, vec![2382]);
    }

    #[test]
    fn packs_nearby_losses_into_one_blp() {
        let packets = build_nack_packets(1, 2, &[10, 11, 20]);
        assert_eq!(packets.len(), 1);
        let (_, _, mut seqs) = parse_nack_packet(&packets[0]).unwrap();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![10, 11, 20]);
    }

    #[test]
    fn sequence_wrap_is_handled() {
        let packets = build_nack_packets(1, 2, &[0]);
        let (_, _, seqs) = parse_nack_packet(&packets[0]).unwrap();
        assert_eq!(seqs, vec![0]);
    }
}
