//! STUN (RFC 5389) wire codec, the subset a binding responder needs.
//!
//! Message layout: `[2 type][2 length][4 magic cookie][12 transaction id][attributes]`,
//! every attribute `[2 type][2 length][value padded to 4 bytes]`.

use crate::error::{SixinError, SixinResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAGIC_COOKIE: u32 = 0x2112A442;
pub const HEADER_LEN: usize = 20;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_SOFTWARE: u16 = 0x8022;
pub const ATTR_FINGERPRINT: u16 = 0x8028;

const FINGERPRINT_XOR: u32 = 0x5354554e;
const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

// CRC-32 (IEEE, reflected) for the FINGERPRINT attribute.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFFFFFF
}

pub type TransactionId = [u8; 12];

/// Cheap format check run on every datagram before any decoding.
///
/// Two leading zero bits, a 4-byte aligned length that matches the
/// datagram, and the magic cookie.
pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN || data[0] & 0xC0 != 0 {
        return false;
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    magic == MAGIC_COOKIE && length % 4 == 0 && HEADER_LEN + length == data.len()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

/// A decoded STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub msg_type: u16,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    /// Full decode: header, attribute walk, and FINGERPRINT verification
    /// when the attribute is present.
    pub fn decode(data: &[u8]) -> SixinResult<Self> {
        if !is_stun_message(data) {
            return Err(SixinError::Codec("not a STUN message".into()));
        }
        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < data.len() {
            if offset + 4 > data.len() {
                return Err(SixinError::Codec("truncated attribute header".into()));
            }
            let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let start = offset + 4;
            let end = start + len;
            if end > data.len() {
                return Err(SixinError::Codec(format!(
                    "attribute 0x{kind:04x} overruns message"
                )));
            }

            if kind == ATTR_FINGERPRINT {
                if len != 4 || end != data.len() {
                    return Err(SixinError::Codec("misplaced FINGERPRINT".into()));
                }
                let expected = crc32(&data[..offset]) ^ FINGERPRINT_XOR;
                let actual =
                    u32::from_be_bytes([data[start], data[start + 1], data[start + 2], data[start + 3]]);
                if expected != actual {
                    return Err(SixinError::Codec("FINGERPRINT mismatch".into()));
                }
            }

            attributes.push(Attribute {
                kind,
                value: data[start..end].to_vec(),
            });
            offset = end + padding(len);
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }

    pub fn is_binding_request(&self) -> bool {
        self.msg_type == BINDING_REQUEST
    }

    pub fn attribute(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    /// The XOR-MAPPED-ADDRESS carried by a response, if any.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attribute(ATTR_XOR_MAPPED_ADDRESS)
            .and_then(|v| decode_xor_address(v, &self.transaction_id))
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Incrementally builds a STUN message, keeping the header length current.
struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: u16, transaction_id: &TransactionId) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(transaction_id);
        Self { buf }
    }

    fn set_length(&mut self, body_len: usize) {
        let len = body_len as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    fn attribute(&mut self, kind: u16, value: &[u8]) {
        self.buf.extend_from_slice(&kind.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self.buf.resize(self.buf.len() + padding(value.len()), 0);
        let body = self.buf.len() - HEADER_LEN;
        self.set_length(body);
    }

    /// Append FINGERPRINT. The CRC covers the header with its length
    /// already including the fingerprint attribute.
    fn fingerprint(mut self) -> Vec<u8> {
        let body = self.buf.len() - HEADER_LEN + 8;
        self.set_length(body);
        let crc = crc32(&self.buf) ^ FINGERPRINT_XOR;
        self.attribute(ATTR_FINGERPRINT, &crc.to_be_bytes());
        self.buf
    }
}

/// Binding Success Response echoing `transaction_id` and reporting `observed`
/// as XOR-MAPPED-ADDRESS, terminated by FINGERPRINT.
pub fn build_binding_response(transaction_id: &TransactionId, observed: SocketAddr) -> Vec<u8> {
    let mut msg = MessageBuilder::new(BINDING_RESPONSE, transaction_id);
    msg.attribute(
        ATTR_XOR_MAPPED_ADDRESS,
        &encode_xor_address(observed, transaction_id),
    );
    msg.attribute(ATTR_SOFTWARE, concat!("sixin ", env!("CARGO_PKG_VERSION")).as_bytes());
    msg.fingerprint()
}

/// Binding Request with a FINGERPRINT, as a client would send it.
pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    MessageBuilder::new(BINDING_REQUEST, transaction_id).fingerprint()
}

pub fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut value = vec![0];
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_V4);
            value.extend_from_slice(&xport.to_be_bytes());
            let cookie = MAGIC_COOKIE.to_be_bytes();
            value.extend(ip.octets().iter().zip(cookie).map(|(a, b)| a ^ b));
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_V6);
            value.extend_from_slice(&xport.to_be_bytes());
            let key = v6_xor_key(transaction_id);
            value.extend(ip.octets().iter().zip(key).map(|(a, b)| a ^ b));
        }
    }
    value
}

pub fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        FAMILY_V4 if value.len() == 8 => {
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let mut octets = [0u8; 4];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ cookie[i];
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_V6 if value.len() == 20 => {
            let key = v6_xor_key(transaction_id);
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn v6_xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXN: TransactionId = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn format_check_rejects_noise() {
        assert!(!is_stun_message(b""));
        assert!(!is_stun_message(&[0u8; 19]));
        assert!(!is_stun_message(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        let mut rtp = build_binding_request(&TXN);
        rtp[0] = 0x80;
        assert!(!is_stun_message(&rtp));
        let mut bad_len = build_binding_request(&TXN);
        bad_len.push(0);
        assert!(!is_stun_message(&bad_len));
    }

    #[test]
    fn request_decodes_with_fingerprint() {
        let req = build_binding_request(&TXN);
        assert!(is_stun_message(&req));
        let msg = StunMessage::decode(&req).unwrap();
        assert!(msg.is_binding_request());
        assert_eq!(msg.transaction_id, TXN);
        assert!(msg.attribute(ATTR_FINGERPRINT).is_some());
    }

    #[test]
    fn corrupted_fingerprint_rejected() {
        let mut req = build_binding_request(&TXN);
        let last = req.len() - 1;
        req[last] ^= 0xFF;
        assert!(StunMessage::decode(&req).is_err());
    }

    #[test]
    fn overrunning_attribute_rejected() {
        let mut msg = MessageBuilder::new(BINDING_REQUEST, &TXN);
        msg.attribute(ATTR_SOFTWARE, b"abcd");
        let mut raw = msg.buf;
        // Claim a longer value than present.
        raw[22..24].copy_from_slice(&64u16.to_be_bytes());
        assert!(is_stun_message(&raw));
        assert!(StunMessage::decode(&raw).is_err());
    }

    #[test]
    fn response_echoes_transaction_and_v4_address() {
        let observed: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let resp = build_binding_response(&TXN, observed);
        let msg = StunMessage::decode(&resp).unwrap();
        assert_eq!(msg.msg_type, BINDING_RESPONSE);
        assert_eq!(msg.transaction_id, TXN);
        assert_eq!(msg.xor_mapped_address(), Some(observed));
        assert_eq!(msg.attributes.last().map(|a| a.kind), Some(ATTR_FINGERPRINT));
    }

    #[test]
    fn response_v6_address() {
        let observed: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let resp = build_binding_response(&TXN, observed);
        let msg = StunMessage::decode(&resp).unwrap();
        assert_eq!(msg.xor_mapped_address(), Some(observed));
    }

    #[test]
    fn xor_address_is_obfuscated_on_the_wire() {
        let observed: SocketAddr = "192.0.2.1:8080".parse().unwrap();
        let value = encode_xor_address(observed, &TXN);
        assert_eq!(value.len(), 8);
        assert_ne!(&value[4..], &[192, 0, 2, 1]);
        assert_eq!(decode_xor_address(&value, &TXN), Some(observed));
        assert_eq!(decode_xor_address(&value[..6], &TXN), None);
    }
}
