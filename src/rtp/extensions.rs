//! RTP header extensions consumed by the core: `abs-send-time` and
//! `transport-wide-cc-01` (`spec.md` §6).
//!
//! Extension IDs are negotiated per-session by the out-of-scope SDP/control
//! plane; callers pass the negotiated one-byte IDs in.

/// Walks a one-byte-form RTP extension block (the `0xBEDE` profile) and
/// invokes `f(id, data)` for each entry. Two-byte-form blocks
/// (`0x1000`-prefixed profile with a second nibble) are not produced by any
/// browser this core targets and are not parsed.
pub fn for_each_one_byte_extension(block: &[u8], mut f: impl FnMut(u8, &[u8])) {
    if block.len() < 4 {
        return;
    }
    let profile = u16::from_be_bytes([block[0], block[1]]);
    if profile != 0xBEDE {
        return;
    }
    let len_words = u16::from_be_bytes([block[2], block[3]]) as usize;
    let body = &block[4..];
    let body = &body[..body.len().min(len_words * 4)];
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b == 0x00 {
            // Padding.
            i += 1;
            continue;
        }
        let id = b >> 4;
        let len = (b & 0x0F) as usize + 1;
        i += 1;
        if i + len > body.len() {
            break;
        }
        f(id, &body[i..i + len]);
        i += len;
    }
}

/// `abs-send-time`: a 24-bit fixed-point seconds-since-epoch value (6.18
/// format), carried as a 3-byte extension payload.
#[must_use]
pub fn parse_abs_send_time(data: &[u8]) -> Option<u32> {
    if data.len() != 3 {
        return None;
    }
    Some(u32::from_be_bytes([0, data[0], data[1], data[2]]))
}

/// Expands a 24-bit `abs-send-time` value into the 32-bit timebase used for
/// delta math in `InterArrival`/REMB (`spec.md` §4.H, §4.I): left-shifted by
/// 8 bits so that subtraction of two values wraps exactly like the 24-bit
/// original, but deltas can be computed as signed 32-bit integers.
#[must_use]
pub fn abs_send_time_to_32_bits(abs_send_time_24: u32) -> u32 {
    abs_send_time_24 << 8
}

/// `transport-wide-cc-01`: a 16-bit wide sequence number.
#[must_use]
pub fn parse_transport_cc_wide_seq(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_one_byte_extensions() {
        // profile 0xBEDE, 1 word, one extension id=1 len=3 with abs-send-time.
        let block: [u8; 8] = [0xBE, 0xDE, 0x00, 0x01, 0x12, 0x34, 0x56, 0x78];
        let mut found = Vec::new();
        for_each_one_byte_extension(&block, |id, data| found.push((id, data.to_vec())));
        assert_eq!(found, vec![(1, vec![0x34, 0x56, 0x78])]);
    }

    #[test]
    fn abs_send_time_shift_preserves_deltas() {
        let a = abs_send_time_to_32_bits(0x000001);
        let b = abs_send_time_to_32_bits(0x000002);
        assert_eq!(b.wrapping_sub(a), 1 << 8);
    }
}
