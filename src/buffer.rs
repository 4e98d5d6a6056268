//! Reference counted byte ranges.
//!
//! A [`Buffer`] is an immutable view into a shared allocation; slicing it never
//! copies. A [`BufferMut`] is the writable counterpart used while a message is
//! being built: it keeps a reserved *left margin* in front of the payload so
//! that envelopes and length prefixes can be prepended in place once the
//! payload size is known.

use std::fmt;
use std::io;
use std::ops::Deref;

use bytes::{BufMut, Bytes, BytesMut};

/// Read-only view into a shared allocation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Bytes,
    offset: usize,
    len: usize,
}

impl Buffer {
    /// wrap a whole allocation
    pub fn new(data: Bytes) -> Self {
        let len = data.len();
        Buffer {
            data,
            offset: 0,
            len,
        }
    }

    /// copy a slice into a fresh allocation
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Buffer::new(Bytes::copy_from_slice(data))
    }

    /// payload length
    pub fn len(&self) -> usize {
        self.len
    }

    /// true if the view covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// bytes of the backing allocation in front of this view
    pub fn left_margin(&self) -> usize {
        self.offset
    }

    /// sub view of `len` bytes starting at `offset`, sharing the allocation
    pub fn slice(&self, offset: usize, len: usize) -> Buffer {
        assert!(
            offset + len <= self.len,
            "slice {offset}+{len} out of range for buffer of {}",
            self.len
        );
        Buffer {
            data: self.data.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// sub view from `offset` to the end
    pub fn slice_from(&self, offset: usize) -> Buffer {
        assert!(offset <= self.len, "slice offset {offset} out of range");
        self.slice(offset, self.len - offset)
    }

    /// the viewed bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// true if both views point into the same allocation
    pub fn shares_allocation(&self, other: &Buffer) -> bool {
        self.data.as_ptr() == other.data.as_ptr()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Buffer::new(data)
    }
}

impl From<BytesMut> for Buffer {
    fn from(data: BytesMut) -> Self {
        Buffer::new(data.freeze())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::new(Bytes::from(data))
    }
}

/// Growable buffer with a reserved left margin in front of its payload.
#[derive(Debug)]
pub struct BufferMut {
    data: BytesMut,
    margin: usize,
}

impl BufferMut {
    /// create a buffer reserving `margin` bytes for later prepending
    pub fn with_margin(margin: usize) -> Self {
        BufferMut::with_capacity(margin, 128)
    }

    /// same as `with_margin`, with room for `capacity` payload bytes
    pub fn with_capacity(margin: usize, capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(margin + capacity);
        data.resize(margin, 0);
        BufferMut { data, margin }
    }

    /// bytes still available for prepending
    pub fn left_margin(&self) -> usize {
        self.margin
    }

    /// payload length
    pub fn len(&self) -> usize {
        self.data.len() - self.margin
    }

    /// true if nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// the payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[self.margin..]
    }

    /// append to the payload
    pub fn put_slice(&mut self, data: &[u8]) {
        self.data.put_slice(data);
    }

    /// append `n` zero bytes and return them for writing
    pub fn append_zeroed(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    /// Moves `n` bytes out of the margin into the front of the payload and
    /// returns them for writing.
    pub fn expand_into_margin(&mut self, n: usize) -> &mut [u8] {
        assert!(
            n <= self.margin,
            "cannot expand {n} bytes into a margin of {}",
            self.margin
        );
        self.margin -= n;
        &mut self.data[self.margin..self.margin + n]
    }

    /// freeze into a shared view, the remaining margin is kept in front
    pub fn freeze(self) -> Buffer {
        let offset = self.margin;
        let data = self.data.freeze();
        let len = data.len() - offset;
        Buffer { data, offset, len }
    }
}

impl io::Write for BufferMut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// total payload length of a buffer list
pub fn total_len(bufs: &[Buffer]) -> usize {
    bufs.iter().map(Buffer::len).sum()
}

/// views of `bufs` with the first `skip` bytes removed
pub fn skip_bytes(bufs: &[Buffer], mut skip: usize) -> Vec<Buffer> {
    let mut out = Vec::with_capacity(bufs.len());
    for b in bufs {
        if skip >= b.len() {
            skip -= b.len();
            continue;
        }
        out.push(b.slice_from(skip));
        skip = 0;
    }
    out
}

/// Joins a buffer list. A single buffer is returned as is, without copying.
pub fn concat(bufs: &[Buffer]) -> Buffer {
    match bufs {
        [] => Buffer::default(),
        [one] => one.clone(),
        _ => {
            let mut data = BytesMut::with_capacity(total_len(bufs));
            for b in bufs {
                data.put_slice(b);
            }
            Buffer::from(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn slicing_reads_the_same_bytes() {
        let data: Vec<u8> = (0..=255u8).collect();
        let buf = Buffer::from(data.clone());
        for (offset, len) in [(0, 0), (0, 256), (1, 10), (100, 156), (255, 1), (17, 0)] {
            let s = buf.slice(offset, len);
            assert_eq!(&s[..], &data[offset..offset + len]);
            assert!(s.shares_allocation(&buf));
            assert_eq!(s.left_margin(), offset);
        }
        let nested = buf.slice(10, 100).slice(5, 20);
        assert_eq!(&nested[..], &data[15..35]);
    }

    #[test]
    #[should_panic]
    fn slicing_past_the_end_fails_fast() {
        let buf = Buffer::from(vec![0u8; 8]);
        buf.slice(4, 5);
    }

    #[test]
    fn header_goes_into_the_margin() {
        let mut b = BufferMut::with_margin(8);
        b.write_all(b"payload").unwrap();
        assert_eq!(b.left_margin(), 8);
        b.expand_into_margin(3).copy_from_slice(b"hdr");
        assert_eq!(b.payload(), b"hdrpayload");
        assert_eq!(b.left_margin(), 5);

        let frozen = b.freeze();
        assert_eq!(&frozen[..], b"hdrpayload");
        assert_eq!(frozen.left_margin(), 5);
    }

    #[test]
    #[should_panic]
    fn margin_overflow_fails_fast() {
        let mut b = BufferMut::with_margin(2);
        b.expand_into_margin(3);
    }

    #[test]
    fn skip_and_concat() {
        let bufs = vec![Buffer::from(b"abc".to_vec()), Buffer::from(b"defg".to_vec())];
        assert_eq!(total_len(&bufs), 7);
        assert_eq!(&concat(&skip_bytes(&bufs, 2))[..], b"cdefg");
        assert_eq!(&concat(&skip_bytes(&bufs, 3))[..], b"defg");
        assert!(skip_bytes(&bufs, 7).is_empty());

        let single = concat(&bufs[..1]);
        assert!(single.shares_allocation(&bufs[0]));
    }
}
