//! Byte buffer with reserved front headroom.
//!
//! Message encryption prepends a 24-byte `key_id || msg_key` header to a
//! payload that was already serialized. Reserving headroom up front makes
//! that prepend a copy into spare capacity instead of a shift of the whole
//! buffer.

/// Growable byte buffer that can be extended at both ends.
#[derive(Clone, Debug)]
pub struct PrefixBuffer {
    buf: Vec<u8>,
    head: usize,
}

impl PrefixBuffer {
    /// Create a buffer with `front` bytes of headroom and capacity for
    /// `back` payload bytes.
    pub fn with_capacity(back: usize, front: usize) -> Self {
        let mut buf = Vec::with_capacity(front + back);
        buf.resize(front, 0);
        Self { buf, head: front }
    }

    /// Prepend `slice`, consuming headroom (or shifting if exhausted).
    pub fn push_front(&mut self, slice: &[u8]) {
        if self.head < slice.len() {
            let shift = slice.len() - self.head;
            self.buf.splice(0..0, std::iter::repeat_n(0, shift));
            self.head = slice.len();
        }
        self.head -= slice.len();
        self.buf[self.head..self.head + slice.len()].copy_from_slice(slice);
    }

    /// Number of payload bytes (headroom excluded).
    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    /// True if no payload bytes are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for PrefixBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf[self.head..]
    }
}

impl AsMut<[u8]> for PrefixBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }
}

impl Extend<u8> for PrefixBuffer {
    fn extend<T: IntoIterator<Item = u8>>(&mut self, iter: T) {
        self.buf.extend(iter);
    }
}

impl<'a> Extend<&'a u8> for PrefixBuffer {
    fn extend<T: IntoIterator<Item = &'a u8>>(&mut self, iter: T) {
        self.buf.extend(iter);
    }
}
