use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::Duration;

/// Stream Extension
pub trait StreamExt: Read + Write + Send + 'static {
    /// try clone the stream
    fn try_clone(&self) -> io::Result<BoxStream>;
    /// set read timeout, `None` blocks forever
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// set write timeout, `None` blocks forever
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// shut down one or both halves
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
    /// printable peer address
    fn peer(&self) -> String;
}

/// A type erased connection.
pub type BoxStream = Box<dyn StreamExt>;

macro_rules! impl_stream_ext {
    ($name: ty, $peer: expr) => {
        impl StreamExt for $name {
            fn try_clone(&self) -> io::Result<BoxStream> {
                (*self).try_clone().map(|s| Box::new(s) as BoxStream)
            }
            fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
                (*self).set_read_timeout(timeout)
            }
            fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
                (*self).set_write_timeout(timeout)
            }
            fn shutdown(&self, how: Shutdown) -> io::Result<()> {
                (*self).shutdown(how)
            }
            fn peer(&self) -> String {
                let peer: fn(&$name) -> String = $peer;
                peer(self)
            }
        }
    };
}

impl_stream_ext!(may::net::TcpStream, |s| s
    .peer_addr()
    .map(|a| a.to_string())
    .unwrap_or_else(|_| "tcp".to_owned()));
#[cfg(unix)]
impl_stream_ext!(may::os::unix::net::UnixStream, |_| "unix".to_owned());

/// Copies everything from `from` into `to` until either side fails, then
/// shuts down the write half of `to`.
pub fn pipe(mut from: BoxStream, mut to: BoxStream) -> u64 {
    let copied = io::copy(&mut from, &mut to).unwrap_or_else(|e| {
        debug!("pipe ended: {e}");
        0
    });
    to.shutdown(Shutdown::Write).ok();
    copied
}
