//! Common RTCP header (RFC 3550 §6.1) and the feedback-packet header shape
//! shared by NACK, PLI, FIR, REMB and transport-cc feedback (RFC 4585).

use bytes::{BufMut, BytesMut};

use crate::error::MalformedPacket;

pub const RTP_VERSION: u8 = 2;

/// `PT=205` Transport layer feedback (NACK, transport-cc).
pub const PT_RTPFB: u8 = 205;
/// `PT=206` Payload-specific feedback (PLI, FIR, REMB).
pub const PT_PSFB: u8 = 206;

pub const FMT_NACK: u8 = 1;
pub const FMT_TCC: u8 = 15;
pub const FMT_PLI: u8 = 1;
pub const FMT_FIR: u8 = 4;
pub const FMT_AFB: u8 = 15;

/// Parsed common header of one RTCP feedback packet.
#[derive(Clone, Copy, Debug)]
pub struct FeedbackHeader {
    pub fmt: u8,
    pub packet_type: u8,
    /// Length of this packet's body (after the 12-byte SSRC-carrying
    /// header), in bytes.
    pub body_len: usize,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl FeedbackHeader {
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), MalformedPacket> {
        if buf.len() < 12 {
            return Err(MalformedPacket::new("RTCP feedback header shorter than 12 bytes"));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(MalformedPacket::new("RTCP version field is not 2"));
        }
        let fmt = buf[0] & 0x1F;
        let packet_type = buf[1];
        let length_words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let total_len = (length_words + 1) * 4;
        if total_len > buf.len() {
            return Err(MalformedPacket::new("RTCP length field overruns buffer"));
        }
        let sender_ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let media_ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok((
            Self {
                fmt,
                packet_type,
                body_len: total_len - 12,
                sender_ssrc,
                media_ssrc,
            },
            &buf[12..total_len],
        ))
    }
}

/// Writes the 12-byte common feedback header (version/padding/fmt, packet
/// type, length placeholder, sender SSRC, media SSRC) and returns the
/// offset of the length field so the caller can patch it once the body is
/// known.
pub fn write_feedback_header(
    buf: &mut BytesMut,
    fmt: u8,
    packet_type: u8,
    sender_ssrc: u32,
    media_ssrc: u32,
) -> usize {
    buf.put_u8((RTP_VERSION << 6) | (fmt & 0x1F));
    buf.put_u8(packet_type);
    let length_offset = buf.len();
    buf.put_u16(0); // patched in `patch_length`.
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    length_offset
}

/// Patches the 16-bit length field written by [`write_feedback_header`] now
/// that the full packet size is known. `length_offset` is the value
/// returned by that call; `total_len` is the packet's length in bytes.
pub fn patch_length(buf: &mut BytesMut, length_offset: usize, total_len: usize) {
    debug_assert_eq!(total_len % 4, 0, "RTCP packets are 32-bit aligned");
    let words = (total_len / 4 - 1) as u16;
    buf[length_offset..length_offset + 2].copy_from_slice(&words.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_feedback_header() {
        let mut buf = BytesMut::new();
        let off = write_feedback_header(&mut buf, FMT_NACK, PT_RTPFB, 1, 2);
        patch_length(&mut buf, off, buf.len());
        let (hdr, body) = FeedbackHeader::parse(&buf).unwrap();
        assert_eq!(hdr.fmt, FMT_NACK);
        assert_eq!(hdr.packet_type, PT_RTPFB);
        assert_eq!(hdr.sender_ssrc, 1);
        assert_eq!(hdr.media_ssrc, 2);
        assert!(body.is_empty());
    }
}
