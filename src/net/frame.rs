use std::io::{self, Read, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use bytes::BytesMut;

use crate::buffer::{self, Buffer, BufferMut};
use crate::codec::ResponseHeader;

// Frame layout
// len(u32, big endian) + message([u8; len])

// response message layout
// response header + payload

/// size of the length prefix
pub const FRAME_PREFIX_LEN: usize = 4;
const RESPONSE_HEADER_MAX_LEN: usize = 3;

/// read the length prefix of the next frame
pub fn read_len<R: Read>(r: &mut R) -> io::Result<usize> {
    Ok(r.read_u32::<BigEndian>()? as usize)
}

/// read a message body of `len` bytes
pub fn read_body<R: Read>(r: &mut R, len: usize, buf: &mut BytesMut) -> io::Result<Buffer> {
    buf.clear();
    buf.resize(len, 0);
    r.read_exact(&mut buf[..])?;
    Ok(Buffer::from(buf.split()))
}

/// read one whole frame, rejecting lengths above `max_len`
pub fn read_frame<R: Read>(r: &mut R, buf: &mut BytesMut, max_len: usize) -> io::Result<Buffer> {
    let len = read_len(r)?;
    if len > max_len {
        let s = format!("frame length {len} exceeds the limit {max_len}");
        error!("{s}");
        return Err(io::Error::new(io::ErrorKind::InvalidData, s));
    }
    read_body(r, len, buf)
}

/// write every buffer of a frame
pub fn write_frame<W: Write>(w: &mut W, frame: &[Buffer]) -> io::Result<()> {
    for b in frame {
        w.write_all(b)?;
    }
    w.flush()
}

/// Prepends the total length of `head` and `tail` into the margin of `head`.
pub fn finish_frame(mut head: BufferMut, tail: Vec<Buffer>) -> Vec<Buffer> {
    let len = head.len() + buffer::total_len(&tail);
    BigEndian::write_u32(head.expand_into_margin(FRAME_PREFIX_LEN), len as u32);
    let mut frame = Vec::with_capacity(tail.len() + 1);
    frame.push(head.freeze());
    frame.extend(tail);
    frame
}

/// a complete error frame
pub fn error_frame(header: ResponseHeader) -> Vec<Buffer> {
    let mut head = BufferMut::with_capacity(FRAME_PREFIX_LEN, header.encoded_len());
    header.encode(head.append_zeroed(header.encoded_len()), &mut 0);
    finish_frame(head, Vec::new())
}

/// Request argument buffer that can be serialized into.
#[derive(Debug)]
pub struct ReqBuf(BufferMut);

impl Default for ReqBuf {
    fn default() -> Self {
        ReqBuf::new()
    }
}

impl ReqBuf {
    /// create a new `ReqBuf` instance
    pub fn new() -> Self {
        ReqBuf(BufferMut::with_margin(0))
    }

    /// the serialized arguments
    pub fn finish(self) -> Buffer {
        self.0.freeze()
    }
}

impl Write for ReqBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Response buffer that can be serialized into. Leaves room in front of the
/// payload for the response header and the frame prefix.
#[derive(Debug)]
pub struct RspBuf(BufferMut);

impl Default for RspBuf {
    fn default() -> Self {
        RspBuf::new()
    }
}

impl RspBuf {
    /// create a new `RspBuf` instance
    pub fn new() -> Self {
        RspBuf(BufferMut::with_margin(FRAME_PREFIX_LEN + RESPONSE_HEADER_MAX_LEN))
    }

    /// payload written so far
    pub fn payload(&self) -> &[u8] {
        self.0.payload()
    }

    /// Writes `header` in front of the payload. The result keeps enough
    /// margin for the frame prefix.
    pub(crate) fn finish(mut self, header: ResponseHeader) -> BufferMut {
        let len = header.encoded_len();
        debug_assert!(len <= RESPONSE_HEADER_MAX_LEN);
        header.encode(self.0.expand_into_margin(len), &mut 0);
        self.0
    }
}

impl Write for RspBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use std::io::Cursor;

    #[test]
    fn response_header_is_prepended_in_place() {
        let mut rsp = RspBuf::new();
        rsp.write_all(b"result").unwrap();
        let body = rsp.finish(ResponseHeader::Return);
        let frame = finish_frame(body, Vec::new());
        assert_eq!(frame.len(), 1);
        assert_eq!(&frame[0][..], b"\x00\x00\x00\x09\x02\x00\x00result");
        assert_eq!(frame[0].left_margin(), 0);
    }

    #[test]
    fn oversized_frames_are_refused() {
        let frame = error_frame(ResponseHeader::error(ErrorCode::SERVER_MESSAGE_LENGTH));
        assert_eq!(&frame[0][..], &[0, 0, 0, 3, 0, 0, 2]);

        let mut buf = BytesMut::new();
        let mut r = Cursor::new(vec![0, 0, 1, 0]);
        let err = read_frame(&mut r, &mut buf, 255).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut r = Cursor::new(vec![0, 0, 0, 2, 7, 8]);
        assert_eq!(&read_frame(&mut r, &mut buf, 255).unwrap()[..], &[7, 8]);
    }
}
