use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

use super::{Filter, FilterDescription, Link};
use crate::buffer::{self, Buffer};
use crate::errors::{Error, ErrorCode};

const BLOCK_HEADER_LEN: usize = 4;
/// largest block accepted from the wire
pub const MAX_BLOCK_LEN: usize = 64 * 1024 * 1024;

/// Whole-block transform used by [`BlockFilter`].
pub trait BlockCodec: Send {
    /// static description of the filter type
    fn description(&self) -> &'static FilterDescription;
    /// transform one block of cleartext
    fn seal(&mut self, clear: &[u8]) -> Result<Vec<u8>, Error>;
    /// invert `seal`
    fn open(&mut self, block: &[u8]) -> Result<Vec<u8>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Body(usize),
}

/// Frames each write as `[u32 len][sealed block]` and reassembles blocks on
/// the read side, however the wire side chops them up.
pub struct BlockFilter<C> {
    codec: C,
    outgoing: Buffer,
    outgoing_clear: usize,
    state: ReadState,
    partial: BytesMut,
    wanted: usize,
    ready: Buffer,
}

impl<C: BlockCodec> BlockFilter<C> {
    /// wrap a codec
    pub fn new(codec: C) -> Self {
        BlockFilter {
            codec,
            outgoing: Buffer::default(),
            outgoing_clear: 0,
            state: ReadState::Header,
            partial: BytesMut::new(),
            wanted: 0,
            ready: Buffer::default(),
        }
    }

    fn request_more(&self, link: &mut Link<'_>) {
        let need = match self.state {
            ReadState::Header => BLOCK_HEADER_LEN - self.partial.len(),
            ReadState::Body(len) => len - self.partial.len(),
        };
        link.read(need);
    }

    fn deliver(&mut self, link: &mut Link<'_>) {
        let n = self.wanted.min(self.ready.len());
        let out = self.ready.slice(0, n);
        self.ready = self.ready.slice_from(n);
        link.read_completed(out);
    }

    fn finish_block(&mut self, link: &mut Link<'_>) -> Result<(), Error> {
        let clear = self.codec.open(&self.partial)?;
        self.partial.clear();
        self.state = ReadState::Header;
        self.ready = Buffer::from(clear);
        if self.ready.is_empty() {
            self.request_more(link);
        } else {
            self.deliver(link);
        }
        Ok(())
    }
}

impl<C: BlockCodec> Filter for BlockFilter<C> {
    fn description(&self) -> &'static FilterDescription {
        self.codec.description()
    }

    fn reset(&mut self) {
        self.outgoing = Buffer::default();
        self.outgoing_clear = 0;
        self.state = ReadState::Header;
        self.partial.clear();
        self.wanted = 0;
        self.ready = Buffer::default();
    }

    fn write(&mut self, link: &mut Link<'_>, bufs: Vec<Buffer>) -> Result<(), Error> {
        let clear = buffer::concat(&bufs);
        let sealed = self.codec.seal(&clear)?;
        if sealed.len() > MAX_BLOCK_LEN {
            return Err(Error::filter(
                ErrorCode::FILTER_MESSAGE,
                format!("block of {} bytes is too large", sealed.len()),
            ));
        }
        let mut framed = BytesMut::with_capacity(BLOCK_HEADER_LEN + sealed.len());
        framed.put_u32(sealed.len() as u32);
        framed.put_slice(&sealed);
        self.outgoing = Buffer::from(framed);
        self.outgoing_clear = clear.len();
        link.write(vec![self.outgoing.clone()]);
        Ok(())
    }

    fn on_write_completed(&mut self, link: &mut Link<'_>, n: usize) -> Result<(), Error> {
        let n = n.min(self.outgoing.len());
        self.outgoing = self.outgoing.slice_from(n);
        if self.outgoing.is_empty() {
            link.write_completed(std::mem::take(&mut self.outgoing_clear));
        } else {
            link.write(vec![self.outgoing.clone()]);
        }
        Ok(())
    }

    fn read(&mut self, link: &mut Link<'_>, n: usize) -> Result<(), Error> {
        self.wanted = n;
        if self.ready.is_empty() {
            self.request_more(link);
        } else {
            self.deliver(link);
        }
        Ok(())
    }

    fn on_read_completed(&mut self, link: &mut Link<'_>, buf: Buffer) -> Result<(), Error> {
        if buf.is_empty() {
            // wire side is exhausted
            link.read_completed(buf);
            return Ok(());
        }
        self.partial.put_slice(&buf);
        match self.state {
            ReadState::Header => {
                if self.partial.len() < BLOCK_HEADER_LEN {
                    self.request_more(link);
                    return Ok(());
                }
                let len = BigEndian::read_u32(&self.partial[..BLOCK_HEADER_LEN]) as usize;
                self.partial.clear();
                if len > MAX_BLOCK_LEN {
                    return Err(Error::filter(
                        ErrorCode::UNFILTER_MESSAGE,
                        format!("block of {len} bytes is too large"),
                    ));
                }
                self.state = ReadState::Body(len);
                if len == 0 {
                    self.finish_block(link)
                } else {
                    self.request_more(link);
                    Ok(())
                }
            }
            ReadState::Body(len) => {
                if self.partial.len() < len {
                    self.request_more(link);
                    Ok(())
                } else {
                    self.finish_block(link)
                }
            }
        }
    }
}
