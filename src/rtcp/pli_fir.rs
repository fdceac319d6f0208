//! PSFB fmt=1 Picture Loss Indication and fmt=4 Full Intra Request
//! (RFC 4585 §6.3.1, RFC 5104 §4.3.1). Both carry no FCI beyond the common
//! feedback header except FIR, which names a sequence number per requested
//! media source.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{self, FeedbackHeader, FMT_FIR, FMT_PLI, PT_PSFB};
use crate::error::MalformedPacket;

#[must_use]
pub fn build_pli(sender_ssrc: u32, media_ssrc: u32) -> Bytes {
    let mut buf = BytesMut::new();
    let off = header::write_feedback_header(&mut buf, FMT_PLI, PT_PSFB, sender_ssrc, media_ssrc);
    let total = buf.len();
    header::patch_length(&mut buf, off, total);
    buf.freeze()
}

pub fn parse_pli(buf: &[u8]) -> Result<(u32, u32), MalformedPacket> {
    let (hdr, _) = FeedbackHeader::parse(buf)?;
    if hdr.fmt != FMT_PLI || hdr.packet_type != PT_PSFB {
        return Err(MalformedPacket::new("not a PSFB PLI packet"));
    }
    Ok((hdr.sender_ssrc, hdr.media_ssrc))
}

/// One FIR FCI entry: the SSRC being asked for a key frame and a
/// monotonically increasing per-SSRC sequence number the requester bumps on
/// each distinct request so retransmitted FIRs can be told apart from new
/// ones.
#[must_use]
pub fn build_fir(sender_ssrc: u32, target_ssrc: u32, fir_seq: u8) -> Bytes {
    let mut buf = BytesMut::new();
    // FIR's "media_ssrc" field in the common header is unused (set to 0);
    // the real target lives in the FCI.
    let off = header::write_feedback_header(&mut buf, FMT_FIR, PT_PSFB, sender_ssrc, 0);
    buf.put_u32(target_ssrc);
    buf.put_u8(fir_seq);
    buf.put_u8(0);
    buf.put_u16(0);
    let total = buf.len();
    header::patch_length(&mut buf, off, total);
    buf.freeze()
}

pub fn parse_fir(buf: &[u8]) -> Result<(u32, u32, u8), MalformedPacket> {
    let (hdr, body) = FeedbackHeader::parse(buf)?;
    if hdr.fmt != FMT_FIR || hdr.packet_type != PT_PSFB {
        return Err(MalformedPacket::new("not a PSFB FIR packet"));
    }
    if body.len() < 8 {
        return Err(MalformedPacket::new("FIR FCI shorter than one entry"));
    }
    let target_ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let fir_seq = body[4];
    Ok((hdr.sender_ssrc, target_ssrc, fir_seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_pli() {
        let pkt = build_pli(1, 2);
        assert_eq!(parse_pli(&pkt).unwrap(), (1, 2));
    }

    #[test]
    fn round_trips_fir() {
        let pkt = build_fir(1, 3, 7);
        assert_eq!(parse_fir(&pkt).unwrap(), (1, 3, 7));
    }
}
