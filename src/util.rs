//! Byte-level helpers for the W3GS wire format.
//!
//! Everything here fails closed: a read past the end of the buffer or a
//! missing terminator is an error, never a silent truncation.

use anyhow::bail;
use thiserror::Error;

/// Wire-level decode failures. Raised by the buffer helpers and by every
/// packet decoder in [`crate::protocol`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet truncated: need {need} bytes at offset {off}, have {have}")]
    Truncated { off: usize, need: usize, have: usize },

    #[error("missing NUL terminator scanning from offset {0}")]
    MissingNul(usize),

    #[error("bad header byte {0:#04X}, expected 0xF7")]
    BadHeader(u8),

    #[error("length mismatch: header declares {declared}, got {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unexpected packet type {0:#04X}")]
    UnknownType(u8),

    #[error("field out of range: {0}")]
    BadField(&'static str),
}

/// Unsigned little-endian u16 read at `off`.
pub fn u16_le(buf: &[u8], off: usize) -> Result<u16, ProtocolError> {
    match buf.get(off..off + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(ProtocolError::Truncated { off, need: 2, have: buf.len().saturating_sub(off) }),
    }
}

/// Unsigned little-endian u32 read at `off`.
pub fn u32_le(buf: &[u8], off: usize) -> Result<u32, ProtocolError> {
    match buf.get(off..off + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(ProtocolError::Truncated { off, need: 4, have: buf.len().saturating_sub(off) }),
    }
}

pub fn put_u16_le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Appends `s` followed by a NUL terminator.
pub fn put_cstring(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

/// Scans from `off` to the next NUL byte. Returns the bytes before the NUL
/// and the offset just past it.
pub fn extract_cstring(buf: &[u8], off: usize) -> Result<(&[u8], usize), ProtocolError> {
    if off > buf.len() {
        return Err(ProtocolError::Truncated { off, need: 1, have: 0 });
    }
    match buf[off..].iter().position(|&b| b == 0) {
        Some(nul) => Ok((&buf[off..off + nul], off + nul + 1)),
        None => Err(ProtocolError::MissingNul(off)),
    }
}

/// Parses exactly `N` whitespace-separated decimal integers from `text` into
/// a fixed byte array. Used for the binary map fields in the config file
/// (`map_sha1 = 53 190 14 ...`).
pub fn parse_decimal_bytes<const N: usize>(text: &str) -> anyhow::Result<[u8; N]> {
    let mut out = [0u8; N];
    let mut tokens = text.split_whitespace();
    for (i, slot) in out.iter_mut().enumerate() {
        match tokens.next() {
            Some(tok) => {
                // the original format allows values that only fit after
                // truncation to a byte, so parse wide and narrow
                let v: u32 = tok.parse()?;
                *slot = v as u8;
            }
            None => bail!("expected {} decimal bytes, found {}", N, i),
        }
    }
    Ok(out)
}

/// An IPv4 address in the byte order it sits in a W3GS sockaddr block
/// (first octet in the low byte).
pub fn ipv4_to_u32(ip: std::net::Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_le_reads_and_fails_closed() {
        let buf = [0x34, 0x12, 0xFF];
        assert_eq!(u16_le(&buf, 0).unwrap(), 0x1234);
        assert_eq!(u16_le(&buf, 1).unwrap(), 0xFF12);
        assert!(matches!(u16_le(&buf, 2), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_u32_le_roundtrip() {
        let mut buf = Vec::new();
        put_u32_le(&mut buf, 0xDEADBEEF);
        assert_eq!(buf, [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(u32_le(&buf, 0).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_extract_cstring() {
        let buf = b"alice\0rest";
        let (s, next) = extract_cstring(buf, 0).unwrap();
        assert_eq!(s, b"alice");
        assert_eq!(next, 6);
        // the tail has no terminator
        assert_eq!(extract_cstring(buf, 6), Err(ProtocolError::MissingNul(6)));
    }

    #[test]
    fn test_extract_cstring_missing_nul() {
        assert_eq!(extract_cstring(b"abc", 0), Err(ProtocolError::MissingNul(0)));
    }

    #[test]
    fn test_extract_cstring_empty() {
        let (s, next) = extract_cstring(b"\0", 0).unwrap();
        assert_eq!(s, b"");
        assert_eq!(next, 1);
    }

    #[test]
    fn test_put_cstring_roundtrip() {
        let mut buf = Vec::new();
        put_cstring(&mut buf, b"host");
        let (s, next) = extract_cstring(&buf, 0).unwrap();
        assert_eq!(s, b"host");
        assert_eq!(next, 5);
    }

    #[test]
    fn test_parse_decimal_bytes_sha1() {
        // seed scenario: 20 tokens 1..20 parse to the exact byte array
        let s = "1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20";
        let arr: [u8; 20] = parse_decimal_bytes(s).unwrap();
        let expect: Vec<u8> = (1..=20).collect();
        assert_eq!(arr.to_vec(), expect);
    }

    #[test]
    fn test_parse_decimal_bytes_too_few() {
        let r: anyhow::Result<[u8; 4]> = parse_decimal_bytes("1 2 3");
        assert!(r.is_err());
    }

    #[test]
    fn test_parse_decimal_bytes_not_a_number() {
        let r: anyhow::Result<[u8; 2]> = parse_decimal_bytes("1 x");
        assert!(r.is_err());
    }

    #[test]
    fn test_ipv4_wire_order() {
        // 127.0.0.1 on the wire is 7F 00 00 01
        let v = ipv4_to_u32(std::net::Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(v, 0x0100_007F);
    }
}
