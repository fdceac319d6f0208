//! PSFB fmt=15 AFB with identifier `REMB` (draft-alvestrand-rmcat-remb-03).
//!
//! The bitrate is packed as an 18-bit mantissa and 6-bit exponent so values
//! up to roughly 8.6 Tbps fit in 3 bytes: `bitrate = mantissa << exponent`.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{self, FeedbackHeader, FMT_AFB, PT_PSFB};
use crate::error::MalformedPacket;

const REMB_IDENTIFIER: [u8; 4] = *b"REMB";
const MAX_MANTISSA: u64 = (1 << 18) - 1;

fn encode_bitrate(bitrate_bps: u64) -> (u8, u32) {
    let mut mantissa = bitrate_bps;
    let mut exp: u8 = 0;
    while mantissa > MAX_MANTISSA && exp < 63 {
        mantissa >>= 1;
        exp += 1;
    }
    (exp, mantissa.min(MAX_MANTISSA) as u32)
}

#[must_use]
pub fn build_remb(sender_ssrc: u32, bitrate_bps: u64, media_ssrcs: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    let off = header::write_feedback_header(&mut buf, FMT_AFB, PT_PSFB, sender_ssrc, 0);
    buf.put_slice(&REMB_IDENTIFIER);
    let (exp, mantissa) = encode_bitrate(bitrate_bps);
    let word = ((media_ssrcs.len() as u32) << 24) | ((exp as u32) << 18) | (mantissa & 0x3_FFFF);
    buf.put_u32(word);
    for ssrc in media_ssrcs {
        buf.put_u32(*ssrc);
    }
    let total = buf.len();
    header::patch_length(&mut buf, off, total);
    buf.freeze()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remb {
    pub sender_ssrc: u32,
    pub bitrate_bps: u64,
    pub media_ssrcs: Vec<u32>,
}

pub fn parse_remb(buf: &[u8]) -> Result<Remb, MalformedPacket> {
    let (hdr, body) = FeedbackHeader::parse(buf)?;
    if hdr.fmt != FMT_AFB || hdr.packet_type != PT_PSFB {
        return Err(MalformedPacket::new("not a PSFB AFB packet"));
    }
    if body.len() < 8 || body[0..4] != REMB_IDENTIFIER {
        return Err(MalformedPacket::new("AFB packet is not identified as REMB"));
    }
    let packed = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let num_ssrc = (packed >> 24) as usize;
    let exp = ((packed >> 18) & 0x3F) as u8;
    let mantissa = packed & 0x3_FFFF;
    let bitrate_bps = (mantissa as u64) << exp;

    let ssrcs_start = 8;
    let needed = ssrcs_start + num_ssrc * 4;
    if body.len() < needed {
        return Err(MalformedPacket::new("REMB SSRC list shorter than NumSSRC claims"));
    }
    let mut media_ssrcs = Vec::with_capacity(num_ssrc);
    for i in 0..num_ssrc {
        let base = ssrcs_start + i * 4;
        media_ssrcs.push(u32::from_be_bytes([
            body[base],
            body[base + 1],
            body[base + 2],
            body[base + 3],
        ]));
    }
    Ok(Remb {
        sender_ssrc: hdr.sender_ssrc,
        bitrate_bps,
        media_ssrcs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bitrate_and_ssrcs() {
        let ssrcs = [0x02d0_3702, 0x04a7_6747];
        let pkt = build_remb(1, 122_754, &ssrcs);
        let parsed = parse_remb(&pkt).unwrap();
        assert_eq!(parsed.bitrate_bps, 122_754);
        assert_eq!(parsed.media_ssrcs, ssrcs);
    }

    #[test]
    fn large_bitrate_round_trips_within_mantissa_precision() {
        let pkt = build_remb(1, 10_000_000_000, &[1]);
        let parsed = parse_remb(&pkt).unwrap();
        // Exponent/mantissa encoding is lossy above 2^18; verify it is
        // within the representable precision rather than exact.
        let (exp, _) = encode_bitrate(10_000_000_000);
        assert!(parsed.bitrate_bps <= 10_000_000_000);
        assert!(10_000_000_000 - parsed.bitrate_bps < (1u64 << exp));
    }
}
