use std::io;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use super::endpoint::Endpoint;
use super::frame;
use super::stream_ext::BoxStream;
use crate::buffer::Buffer;
use crate::errors::Error;

/// Client side of a connection, all operations bounded by a deadline.
pub trait ClientTransport: Send {
    /// connect unless already connected
    fn connect(&mut self, deadline: Instant) -> Result<(), Error>;
    /// drop the connection
    fn disconnect(&mut self);
    /// true while a connection is held
    fn is_connected(&self) -> bool;
    /// write one frame
    fn send(&mut self, frame: &[Buffer], deadline: Instant) -> Result<(), Error>;
    /// read one frame, rejecting messages above `max_len`
    fn receive(&mut self, deadline: Instant, max_len: usize) -> Result<Buffer, Error>;
    /// give up the underlying stream, for transports that have one
    fn into_stream(self: Box<Self>) -> Option<BoxStream>;
}

/// time left until `deadline`, `None` once it passed
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

pub(crate) fn read_error(e: io::Error) -> Error {
    if is_timeout(&e) {
        Error::ReadTimeout
    } else if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::PeerDisconnect
    } else {
        Error::ReadFail(e)
    }
}

pub(crate) fn write_error(e: io::Error) -> Error {
    if is_timeout(&e) {
        Error::WriteTimeout
    } else if matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    ) {
        Error::PeerDisconnect
    } else {
        Error::WriteFail(e)
    }
}

fn connect_tcp(addr: &str, deadline: Instant) -> io::Result<may::net::TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing");
    for addr in addr.to_socket_addrs()? {
        let Some(left) = remaining(deadline) else {
            return Err(io::ErrorKind::TimedOut.into());
        };
        match may::net::TcpStream::connect_timeout(&addr, left) {
            Ok(s) => return Ok(s),
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn open(endpoint: &Endpoint, deadline: Instant) -> io::Result<BoxStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = connect_tcp(addr, deadline)?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(may::os::unix::net::UnixStream::connect(path)?)),
        Endpoint::Udp(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "udp endpoints have no stream",
        )),
    }
}

/// TCP or Unix domain socket client transport.
pub struct StreamTransport {
    endpoint: Endpoint,
    stream: Option<BoxStream>,
    buf: BytesMut,
}

impl StreamTransport {
    /// unconnected transport for `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        StreamTransport {
            endpoint,
            stream: None,
            buf: BytesMut::with_capacity(1024 * 32),
        }
    }

    /// wrap an already connected stream
    pub fn from_stream(endpoint: Endpoint, stream: BoxStream) -> Self {
        StreamTransport {
            endpoint,
            stream: Some(stream),
            buf: BytesMut::with_capacity(1024 * 32),
        }
    }

    fn stream(&mut self) -> Result<&mut BoxStream, Error> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }
}

impl ClientTransport for StreamTransport {
    fn connect(&mut self, deadline: Instant) -> Result<(), Error> {
        if self.stream.is_some() {
            return Ok(());
        }
        let target = self.endpoint.to_string();
        if remaining(deadline).is_none() {
            return Err(Error::ConnectTimeout(target));
        }
        let stream = open(&self.endpoint, deadline).map_err(|e| {
            if is_timeout(&e) {
                Error::ConnectTimeout(target.clone())
            } else {
                Error::ConnectFail(target.clone(), e)
            }
        })?;
        if remaining(deadline).is_none() {
            return Err(Error::ConnectTimeout(target));
        }
        info!("connected to {target}");
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(s) = self.stream.take() {
            s.shutdown(std::net::Shutdown::Both).ok();
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, frame: &[Buffer], deadline: Instant) -> Result<(), Error> {
        let left = remaining(deadline).ok_or(Error::WriteTimeout)?;
        let stream = self.stream()?;
        stream.set_write_timeout(Some(left)).map_err(Error::WriteFail)?;
        frame::write_frame(stream, frame).map_err(write_error)
    }

    fn receive(&mut self, deadline: Instant, max_len: usize) -> Result<Buffer, Error> {
        let left = remaining(deadline).ok_or(Error::ReadTimeout)?;
        let StreamTransport { stream, buf, .. } = self;
        let stream = stream.as_mut().ok_or(Error::NotConnected)?;
        stream.set_read_timeout(Some(left)).map_err(Error::ReadFail)?;
        let len = frame::read_len(stream).map_err(read_error)?;
        if len > max_len {
            return Err(Error::MessageLength(len, max_len));
        }
        frame::read_body(stream, len, buf).map_err(read_error)
    }

    fn into_stream(mut self: Box<Self>) -> Option<BoxStream> {
        let stream = self.stream.take()?;
        stream.set_read_timeout(None).ok();
        stream.set_write_timeout(None).ok();
        Some(stream)
    }
}
