//! Minimal TL (de)serialization surface.
//!
//! The generated RPC schema lives outside this engine; callers hand us
//! already-serialized request bytes and decode results themselves. This
//! module provides only what the engine itself needs: the collaborator
//! traits, a cursor over received buffers, and the TL string encoding used
//! by the service messages.

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while reading TL data.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Ran out of bytes before the type was fully read.
    UnexpectedEof,
    /// Decoded a constructor ID that doesn't match any known variant.
    UnexpectedConstructor { id: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnexpectedConstructor { id } => {
                write!(f, "unexpected constructor id: {id:#010x}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for TL reads.
pub type Result<T> = std::result::Result<T, Error>;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Serialize `self` into TL binary format.
pub trait Serializable {
    /// Append the serialized form of `self` to `buf`.
    fn serialize(&self, buf: &mut Vec<u8>);

    /// Convenience: allocate a fresh `Vec<u8>` and serialize into it.
    fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.serialize(&mut v);
        v
    }
}

/// Deserialize a value from TL binary format.
pub trait Deserializable: Sized {
    /// Read `Self` from the cursor.
    fn deserialize(cur: &mut Cursor<'_>) -> Result<Self>;

    /// Convenience: deserialize from a complete byte slice.
    fn from_bytes(buf: &[u8]) -> Result<Self> {
        Self::deserialize(&mut Cursor::from_slice(buf))
    }
}

/// An RPC function: serializable request with a typed response.
pub trait RemoteCall: Serializable {
    /// The response type the server answers with.
    type Return: Deserializable;
}

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy reader over an in-memory byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read exactly `out.len()` bytes.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.pos + out.len();
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    /// Borrow the next `n` bytes without copying.
    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// All bytes from the current position to the end.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    /// Read a TL byte string (length prefix + payload + alignment padding).
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let first = *self.buf.get(self.pos).ok_or(Error::UnexpectedEof)?;
        self.pos += 1;
        let (len, consumed) = if first < 254 {
            (first as usize, 1 + first as usize)
        } else {
            let mut b = [0u8; 3];
            self.read_exact(&mut b)?;
            let len = b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16;
            (len, 4 + len)
        };
        let data = self.read_raw(len)?.to_vec();
        // Skip the zero padding to the next 4-byte boundary.
        let pad = (4 - consumed % 4) % 4;
        self.read_raw(pad)?;
        Ok(data)
    }

    /// Read a `Vector<long>` (boxed, with the `0x1cb5c415` header).
    pub fn read_i64_vec(&mut self) -> Result<Vec<i64>> {
        let id = self.read_u32()?;
        if id != VECTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        let count = self.read_i32()?;
        if count < 0 || count as usize * 8 > self.remaining() {
            return Err(Error::UnexpectedEof);
        }
        (0..count).map(|_| self.read_i64()).collect()
    }
}

/// Boxed `Vector` constructor ID.
pub const VECTOR_ID: u32 = 0x1cb5c415;

// ─── Write helpers ───────────────────────────────────────────────────────────

/// Append a TL byte string: length prefix, payload, zero padding to a
/// 4-byte boundary.
pub fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    let header = if len <= 253 {
        buf.push(len as u8);
        1
    } else {
        buf.push(0xfe);
        buf.push(len as u8);
        buf.push((len >> 8) as u8);
        buf.push((len >> 16) as u8);
        4
    };
    buf.extend_from_slice(data);
    let pad = (4 - (header + len) % 4) % 4;
    buf.extend(std::iter::repeat_n(0u8, pad));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_short_and_long() {
        for len in [0usize, 1, 3, 4, 253, 254, 1000] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut buf = Vec::new();
            write_bytes(&mut buf, &data);
            assert_eq!(buf.len() % 4, 0, "len={len} must stay aligned");
            let mut cur = Cursor::from_slice(&buf);
            assert_eq!(cur.read_bytes().unwrap(), data);
            assert_eq!(cur.remaining(), 0);
        }
    }

    #[test]
    fn i64_vec_requires_vector_header() {
        let mut buf = Vec::new();
        buf.extend(0xdeadbeefu32.to_le_bytes());
        let mut cur = Cursor::from_slice(&buf);
        assert!(matches!(
            cur.read_i64_vec(),
            Err(Error::UnexpectedConstructor { id: 0xdeadbeef })
        ));
    }

    #[test]
    fn eof_is_reported() {
        let mut cur = Cursor::from_slice(&[1, 2]);
        assert_eq!(cur.read_i32(), Err(Error::UnexpectedEof));
    }
}
