use bytes::Bytes;

use crate::protocol::UserIdentity;

/// Cursor-based decoder over a received payload.
///
/// Reads never fail individually: a read past the end of the buffer sets a
/// sticky error flag and yields a zero/empty value, so a caller can decode an
/// entire record with straight-line code and check [`ByteCursor::error`] once
/// at the end. All integers are little-endian.
pub struct ByteCursor {
    buf: Bytes,
    pos: usize,
    error: bool,
}

impl ByteCursor {
    pub fn new(buf: Bytes) -> ByteCursor {
        ByteCursor {
            buf,
            pos: 0,
            error: false,
        }
    }

    /// True once any read ran past the end of the buffer or a nested record
    /// failed schema validation. Stays set for the cursor's lifetime.
    pub fn error(&self) -> bool {
        self.error
    }

    /// Poisons the cursor. Used by nested-record decoders to report schema
    /// validation failure through the same channel as a primitive under-read.
    pub fn mark_error(&mut self) {
        self.error = true;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.error || self.remaining() < n {
            self.error = true;
            return None;
        }
        let slice = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Some(slice)
    }

    pub fn get_u8(&mut self) -> u8 {
        match self.take(1) {
            Some(b) => b[0],
            None => 0,
        }
    }

    pub fn get_u16(&mut self) -> u16 {
        match self.take(2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    pub fn get_u32(&mut self) -> u32 {
        match self.take(4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    pub fn get_u64(&mut self) -> u64 {
        match self.take(8) {
            Some(b) => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            None => 0,
        }
    }

    pub fn get_i64(&mut self) -> i64 {
        self.get_u64() as i64
    }

    /// Big-endian read for the few fields the wire spec marks as such.
    pub fn get_u32_be(&mut self) -> u32 {
        match self.take(4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    /// Zero-copy slice of the next `len` bytes. The returned range shares the
    /// cursor's backing buffer, so it stays valid independent of the cursor.
    pub fn get_bytes(&mut self, len: usize) -> Bytes {
        self.take(len).unwrap_or_else(Bytes::new)
    }

    /// u32 length followed by that many bytes.
    pub fn get_bytes_prefixed(&mut self) -> Bytes {
        let len = self.get_u32() as usize;
        self.get_bytes(len)
    }

    /// u32 length followed by that many bytes of UTF-8. Invalid UTF-8 counts
    /// as a malformed record and poisons the cursor.
    pub fn get_string(&mut self) -> String {
        let raw = self.get_bytes_prefixed();
        match std::str::from_utf8(&raw) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                self.error = true;
                String::new()
            }
        }
    }

    /// NUL-terminated string, for legacy identifier fields. Consumes the
    /// terminator; a missing terminator poisons the cursor.
    pub fn get_string_nul(&mut self) -> String {
        if self.error {
            return String::new();
        }
        let rest = &self.buf[self.pos..];
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            self.error = true;
            return String::new();
        };
        let raw = self.buf.slice(self.pos..self.pos + end);
        self.pos += end + 1; // string plus terminator
        match std::str::from_utf8(&raw) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                self.error = true;
                String::new()
            }
        }
    }

    pub fn get_identity(&mut self) -> UserIdentity {
        match self.take(16) {
            Some(b) => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&b);
                UserIdentity(raw)
            }
            None => UserIdentity([0u8; 16]),
        }
    }

    /// Extracts a length-prefixed byte range and returns a child cursor over
    /// it, for handing to a schema-validating sub-decoder. The child shares
    /// the backing buffer; extracting it never copies.
    pub fn sub_record(&mut self) -> ByteCursor {
        ByteCursor::new(self.get_bytes_prefixed())
    }
}
