// Primitive encoders and decoders shared by every message type.
//
// Varints are LEB128 (7 data bits per byte, high bit marks continuation).
// Fixed-width integers are little-endian. Strings and byte slices are
// varint-length-prefixed.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

pub fn put_varint64(out: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

pub fn get_varint64(input: &mut Bytes) -> Result<u64> {
    let mut result: u64 = 0;
    for shift in (0..=63).step_by(7) {
        if !input.has_remaining() {
            return Err(Error::BadVarint);
        }
        let byte = input.get_u8();
        if byte & 0x80 != 0 {
            result |= u64::from(byte & 0x7f) << shift;
        } else {
            result |= u64::from(byte) << shift;
            return Ok(result);
        }
    }
    Err(Error::BadVarint)
}

pub fn put_varint32(out: &mut BytesMut, value: u32) {
    put_varint64(out, u64::from(value));
}

pub fn get_varint32(input: &mut Bytes) -> Result<u32> {
    let value = get_varint64(input)?;
    u32::try_from(value).map_err(|_| Error::BadVarint)
}

pub fn put_fixed16(out: &mut BytesMut, value: u16) {
    out.put_u16_le(value);
}

pub fn get_fixed16(input: &mut Bytes) -> Result<u16> {
    if input.remaining() < 2 {
        return Err(Error::Truncated);
    }
    Ok(input.get_u16_le())
}

pub fn put_fixed64(out: &mut BytesMut, value: u64) {
    out.put_u64_le(value);
}

pub fn get_fixed64(input: &mut Bytes) -> Result<u64> {
    if input.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(input.get_u64_le())
}

pub fn put_length_prefixed(out: &mut BytesMut, value: &[u8]) {
    put_varint64(out, value.len() as u64);
    out.extend_from_slice(value);
}

pub fn get_length_prefixed(input: &mut Bytes) -> Result<Bytes> {
    let len = get_varint64(input)? as usize;
    if input.remaining() < len {
        return Err(Error::Truncated);
    }
    Ok(input.split_to(len))
}

pub fn put_string(out: &mut BytesMut, value: &str) {
    put_length_prefixed(out, value.as_bytes());
}

pub fn get_string(input: &mut Bytes) -> Result<String> {
    let raw = get_length_prefixed(input)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::BadField("string"))
}

/// Encodes a topic identity as its namespace and name, each prefixed.
pub fn put_topic_id(out: &mut BytesMut, namespace: &str, topic: &str) {
    put_string(out, namespace);
    put_string(out, topic);
}

pub fn get_topic_id(input: &mut Bytes) -> Result<(String, String)> {
    let namespace = get_string(input)?;
    let topic = get_string(input)?;
    Ok((namespace, topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_varint64(value: u64) -> u64 {
        let mut buf = BytesMut::new();
        put_varint64(&mut buf, value);
        let mut bytes = buf.freeze();
        let decoded = get_varint64(&mut bytes).expect("varint");
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn varint64_boundaries() {
        for value in [0, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            assert_eq!(round_trip_varint64(value), value);
        }
    }

    #[test]
    fn varint64_encoded_lengths() {
        let mut buf = BytesMut::new();
        put_varint64(&mut buf, 127);
        assert_eq!(buf.len(), 1);
        buf.clear();
        put_varint64(&mut buf, 128);
        assert_eq!(buf.len(), 2);
        buf.clear();
        put_varint64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn varint_rejects_truncation() {
        let mut bytes = Bytes::from_static(&[0x80, 0x80]);
        assert_eq!(get_varint64(&mut bytes), Err(Error::BadVarint));
    }

    #[test]
    fn varint32_rejects_wide_values() {
        let mut buf = BytesMut::new();
        put_varint64(&mut buf, u64::from(u32::MAX) + 1);
        let mut bytes = buf.freeze();
        assert_eq!(get_varint32(&mut bytes), Err(Error::BadVarint));
    }

    #[test]
    fn length_prefixed_round_trip() {
        let mut buf = BytesMut::new();
        put_length_prefixed(&mut buf, b"payload");
        put_string(&mut buf, "topic");
        let mut bytes = buf.freeze();
        assert_eq!(get_length_prefixed(&mut bytes).expect("slice").as_ref(), b"payload");
        assert_eq!(get_string(&mut bytes).expect("string"), "topic");
    }

    #[test]
    fn length_prefixed_rejects_short_input() {
        let mut buf = BytesMut::new();
        put_varint64(&mut buf, 100);
        buf.extend_from_slice(b"short");
        let mut bytes = buf.freeze();
        assert_eq!(get_length_prefixed(&mut bytes), Err(Error::Truncated));
    }

    #[test]
    fn topic_id_round_trip() {
        let mut buf = BytesMut::new();
        put_topic_id(&mut buf, "ns", "orders");
        let mut bytes = buf.freeze();
        let (namespace, topic) = get_topic_id(&mut bytes).expect("topic id");
        assert_eq!(namespace, "ns");
        assert_eq!(topic, "orders");
    }

    #[test]
    fn fixed_width_round_trip() {
        let mut buf = BytesMut::new();
        put_fixed16(&mut buf, 0xBEEF);
        put_fixed64(&mut buf, 0xDEAD_BEEF_CAFE);
        let mut bytes = buf.freeze();
        assert_eq!(get_fixed16(&mut bytes).expect("u16"), 0xBEEF);
        assert_eq!(get_fixed64(&mut bytes).expect("u64"), 0xDEAD_BEEF_CAFE);
        assert_eq!(get_fixed16(&mut Bytes::new()), Err(Error::Truncated));
    }
}
