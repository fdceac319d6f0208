//! STUN wire format (RFC 5389), attributes per `spec.md` §3/§6.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MalformedPacket;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl Class {
    fn from_bits(bits: u16) -> Option<Self> {
        // The class is formed from bits 8 and 4 of the message type.
        match bits {
            0b00 => Some(Self::Request),
            0b01 => Some(Self::Indication),
            0b10 => Some(Self::SuccessResponse),
            0b11 => Some(Self::ErrorResponse),
            _ => None,
        }
    }

    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Binding,
}

mod attr {
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
    /// draft-thatcher-ice-renomination.
    pub const NOMINATION: u16 = 0xC001;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub username: Option<(String, String)>, // (local_ufrag, remote_ufrag)
    pub priority: Option<u32>,
    pub ice_controlling: Option<u64>,
    pub ice_controlled: Option<u64>,
    pub use_candidate: bool,
    pub nomination: Option<u32>,
    pub message_integrity: Option<[u8; 20]>,
    pub has_fingerprint: bool,
    pub error_code: Option<(u8, u8)>, // (class, number)
    pub xor_mapped_address: Option<std::net::SocketAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StunMessage {
    pub class: Class,
    pub method: Method,
    pub transaction_id: [u8; 12],
    pub attributes: Attributes,
    /// The raw bytes this message was parsed from, needed to recompute
    /// MESSAGE-INTEGRITY over the original wire bytes.
    pub raw: Bytes,
}

#[must_use]
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && (data[0] & 0xC0) == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

fn xor_address(attr_body: &[u8], transaction_id: &[u8; 12]) -> Option<std::net::SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    if attr_body.len() < 4 {
        return None;
    }
    let family = attr_body[1];
    let xport = u16::from_be_bytes([attr_body[2], attr_body[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 if attr_body.len() >= 8 => {
            let xaddr = u32::from_be_bytes([attr_body[4], attr_body[5], attr_body[6], attr_body[7]]);
            let addr = xaddr ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
        }
        0x02 if attr_body.len() >= 20 => {
            let mut cookie_and_tx = [0u8; 16];
            cookie_and_tx[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            cookie_and_tx[4..16].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = attr_body[4 + i] ^ cookie_and_tx[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

pub fn parse(data: &[u8]) -> Result<StunMessage, MalformedPacket> {
    if !is_stun(data) {
        return Err(MalformedPacket::new("not a STUN message"));
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let class_bits = ((msg_type & 0x0100) >> 7) | ((msg_type & 0x0010) >> 4);
    let class = Class::from_bits(class_bits).ok_or_else(|| MalformedPacket::new("invalid STUN class"))?;
    let method_bits = (msg_type & 0x3E00) >> 2 | (msg_type & 0x00E0) >> 1 | (msg_type & 0x000F);
    if method_bits != 1 {
        return Err(MalformedPacket::new("unsupported STUN method"));
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if HEADER_LEN + length > data.len() {
        return Err(MalformedPacket::new("STUN length field overruns buffer"));
    }
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&data[8..20]);

    let mut attributes = Attributes::default();
    let mut cursor = &data[HEADER_LEN..HEADER_LEN + length];
    let mut fingerprint_seen = false;
    while cursor.len() >= 4 {
        if fingerprint_seen {
            return Err(MalformedPacket::new("attribute follows FINGERPRINT"));
        }
        let attr_type = u16::from_be_bytes([cursor[0], cursor[1]]);
        let attr_len = u16::from_be_bytes([cursor[2], cursor[3]]) as usize;
        let padded = (attr_len + 3) & !3;
        if cursor.len() < 4 + padded {
            return Err(MalformedPacket::new("STUN attribute overruns body"));
        }
        let body = &cursor[4..4 + attr_len];
        match attr_type {
            attr::USERNAME => {
                let text = std::str::from_utf8(body)
                    .map_err(|_| MalformedPacket::new("USERNAME is not valid UTF-8"))?;
                if let Some((local, remote)) = text.split_once(':') {
                    attributes.username = Some((local.to_string(), remote.to_string()));
                }
            }
            attr::PRIORITY => {
                if body.len() == 4 {
                    attributes.priority = Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
                }
            }
            attr::ICE_CONTROLLING => {
                if body.len() == 8 {
                    attributes.ice_controlling = Some(u64::from_be_bytes(body.try_into().unwrap()));
                }
            }
            attr::ICE_CONTROLLED => {
                if body.len() == 8 {
                    attributes.ice_controlled = Some(u64::from_be_bytes(body.try_into().unwrap()));
                }
            }
            attr::USE_CANDIDATE => attributes.use_candidate = true,
            attr::NOMINATION => {
                if body.len() == 4 {
                    attributes.nomination = Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
                }
            }
            attr::MESSAGE_INTEGRITY => {
                if body.len() == 20 {
                    let mut mi = [0u8; 20];
                    mi.copy_from_slice(body);
                    attributes.message_integrity = Some(mi);
                }
            }
            attr::FINGERPRINT => {
                fingerprint_seen = true;
                attributes.has_fingerprint = true;
            }
            attr::ERROR_CODE => {
                if body.len() >= 4 {
                    attributes.error_code = Some((body[2] & 0x07, body[3]));
                }
            }
            attr::XOR_MAPPED_ADDRESS => {
                attributes.xor_mapped_address = xor_address(body, &transaction_id);
            }
            _ => {}
        }
        cursor = &cursor[4 + padded..];
    }

    Ok(StunMessage {
        class,
        method: Method::Binding,
        transaction_id,
        attributes,
        raw: Bytes::copy_from_slice(&data[..HEADER_LEN + length]),
    })
}

/// Builds a STUN header plus a run of pre-encoded attribute TLVs. Used by
/// [`crate::stun::crypto`] to append MESSAGE-INTEGRITY/FINGERPRINT once the
/// rest of the message is known.
pub fn write_header(buf: &mut BytesMut, class: Class, transaction_id: &[u8; 12]) {
    let method_bits = 1u16; // Binding
    let class_bits = class.bits();
    let msg_type = ((class_bits & 0b10) << 7) | ((class_bits & 0b01) << 4) | method_bits;
    buf.put_u16(msg_type);
    buf.put_u16(0); // length patched by caller once attributes are appended.
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);
}

pub fn patch_length(buf: &mut BytesMut, body_len: usize) {
    buf[2..4].copy_from_slice(&(body_len as u16).to_be_bytes());
}

pub fn put_attr(buf: &mut BytesMut, attr_type: u16, value: &[u8]) {
    buf.put_u16(attr_type);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    let pad = (4 - value.len() % 4) % 4;
    for _ in 0..pad {
        buf.put_u8(0);
    }
}

pub fn xor_mapped_address_value(addr: std::net::SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    use std::net::IpAddr;
    let mut out = Vec::new();
    out.push(0);
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.push(0x01);
            let xport = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
            out.extend_from_slice(&xport.to_be_bytes());
            let xaddr = u32::from(v4) ^ MAGIC_COOKIE;
            out.extend_from_slice(&xaddr.to_be_bytes());
        }
        IpAddr::V6(v6) => {
            out.push(0x02);
            let xport = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
            out.extend_from_slice(&xport.to_be_bytes());
            let mut cookie_and_tx = [0u8; 16];
            cookie_and_tx[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            cookie_and_tx[4..16].copy_from_slice(transaction_id);
            let octets = v6.octets();
            let mut xored = [0u8; 16];
            for i in 0..16 {
                xored[i] = octets[i] ^ cookie_and_tx[i];
            }
            out.extend_from_slice(&xored);
        }
    }
    out
}

pub const ATTR_USERNAME: u16 = attr::USERNAME;
pub const ATTR_MESSAGE_INTEGRITY: u16 = attr::MESSAGE_INTEGRITY;
pub const ATTR_FINGERPRINT: u16 = attr::FINGERPRINT;
pub const ATTR_ERROR_CODE: u16 = attr::ERROR_CODE;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = attr::XOR_MAPPED_ADDRESS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_username_and_priority() {
        let mut buf = BytesMut::new();
        let tx = [7u8; 12];
        write_header(&mut buf, Class::Request, &tx);
        put_attr(&mut buf, attr::USERNAME, b"local:remote");
        put_attr(&mut buf, attr::PRIORITY, &12345u32.to_be_bytes());
        let body_len = buf.len() - HEADER_LEN;
        patch_length(&mut buf, body_len);

        let msg = parse(&buf).unwrap();
        assert_eq!(msg.class, Class::Request);
        assert_eq!(
            msg.attributes.username,
            Some(("local".to_string(), "remote".to_string()))
        );
        assert_eq!(msg.attributes.priority, Some(12345));
    }

    #[test]
    fn rejects_attribute_after_fingerprint() {
        let mut buf = BytesMut::new();
        let tx = [1u8; 12];
        write_header(&mut buf, Class::Request, &tx);
        put_attr(&mut buf, attr::FINGERPRINT, &[0u8; 4]);
        put_attr(&mut buf, attr::USE_CANDIDATE, &[]);
        let body_len = buf.len() - HEADER_LEN;
        patch_length(&mut buf, body_len);
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn xor_mapped_address_v4_round_trips() {
        let addr: std::net::SocketAddr = "192.0.2.1:54321".parse().unwrap();
        let tx = [3u8; 12];
        let value = xor_mapped_address_value(addr, &tx);
        let decoded = xor_address(&value, &tx).unwrap();
        assert_eq!(decoded, addr);
    }
}
