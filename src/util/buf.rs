use bytes::{Buf, BufMut, BytesMut};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Legacy identifier fields are NUL-terminated on the wire rather than
/// length-prefixed.
pub fn put_string_nul(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn put_bytes_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u32_le()? as usize;
    if buf.remaining() < len {
        anyhow::bail!("string length {} exceeds remaining buffer", len);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}
