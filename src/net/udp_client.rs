use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use may::net::UdpSocket;

use super::client::{read_error, remaining, write_error, ClientTransport};
use super::frame::FRAME_PREFIX_LEN;
use super::stream_ext::BoxStream;
use crate::buffer::{self, Buffer};
use crate::errors::Error;

/// largest datagram handled
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Udp client transport, one frame per datagram.
#[derive(Debug)]
pub struct UdpTransport {
    addr: String,
    sock: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// unconnected transport for `addr`
    pub fn new(addr: String) -> Self {
        UdpTransport {
            addr,
            sock: None,
            buf: vec![0; MAX_DATAGRAM_LEN],
        }
    }
}

impl ClientTransport for UdpTransport {
    fn connect(&mut self, deadline: Instant) -> Result<(), Error> {
        if self.sock.is_some() {
            return Ok(());
        }
        if remaining(deadline).is_none() {
            return Err(Error::ConnectTimeout(self.addr.clone()));
        }
        // this would bind a random port by the system
        let bind = if self.addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
        let sock = UdpSocket::bind(bind)
            .and_then(|s| s.connect(self.addr.as_str()).map(|_| s))
            .map_err(|e| Error::ConnectFail(self.addr.clone(), e))?;
        self.sock = Some(sock);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.sock = None;
    }

    fn is_connected(&self) -> bool {
        self.sock.is_some()
    }

    fn send(&mut self, frame: &[Buffer], deadline: Instant) -> Result<(), Error> {
        remaining(deadline).ok_or(Error::WriteTimeout)?;
        let sock = self.sock.as_ref().ok_or(Error::NotConnected)?;
        let datagram = buffer::concat(frame);
        if datagram.len() > MAX_DATAGRAM_LEN {
            return Err(Error::MessageLength(datagram.len(), MAX_DATAGRAM_LEN));
        }
        sock.send(&datagram).map_err(write_error)?;
        Ok(())
    }

    fn receive(&mut self, deadline: Instant, max_len: usize) -> Result<Buffer, Error> {
        let left = remaining(deadline).ok_or(Error::ReadTimeout)?;
        let sock = self.sock.as_ref().ok_or(Error::NotConnected)?;
        sock.set_read_timeout(Some(left)).map_err(Error::ReadFail)?;
        let n = sock.recv(&mut self.buf).map_err(read_error)?;
        if n < FRAME_PREFIX_LEN {
            return Err(Error::Decoding(format!("short datagram of {n} bytes")));
        }
        let len = BigEndian::read_u32(&self.buf[..FRAME_PREFIX_LEN]) as usize;
        if len > max_len {
            return Err(Error::MessageLength(len, max_len));
        }
        if len != n - FRAME_PREFIX_LEN {
            return Err(Error::Decoding(format!(
                "datagram of {n} bytes announces {len} bytes"
            )));
        }
        Ok(Buffer::copy_from_slice(&self.buf[FRAME_PREFIX_LEN..n]))
    }

    fn into_stream(self: Box<Self>) -> Option<BoxStream> {
        None
    }
}
