use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::client::{ClientTransport, StreamTransport};
use super::udp_client::UdpTransport;
use crate::errors::Error;

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// TCP `host:port`
    Tcp(String),
    /// UDP `host:port`, one message per datagram
    Udp(String),
    /// Unix domain socket path
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// TCP endpoint
    pub fn tcp(addr: impl ToString) -> Self {
        Endpoint::Tcp(addr.to_string())
    }

    /// UDP endpoint
    pub fn udp(addr: impl ToString) -> Self {
        Endpoint::Udp(addr.to_string())
    }

    /// Unix domain socket endpoint
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    /// a fresh, unconnected client transport for this endpoint
    pub fn client_transport(&self) -> Box<dyn ClientTransport> {
        match self {
            Endpoint::Udp(addr) => Box::new(UdpTransport::new(addr.clone())),
            _ => Box::new(StreamTransport::new(self.clone())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Udp(addr) => write!(f, "udp://{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// `tcp://host:port`, `udp://host:port`, `unix://path` or a bare
    /// `host:port` meaning TCP
    fn from_str(s: &str) -> Result<Self, Error> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Endpoint::tcp(addr));
        }
        if let Some(addr) = s.strip_prefix("udp://") {
            return Ok(Endpoint::udp(addr));
        }
        #[cfg(unix)]
        if let Some(path) = s.strip_prefix("unix://") {
            return Ok(Endpoint::unix(path));
        }
        if s.is_empty() || s.contains("://") {
            return Err(Error::NoEndpoint);
        }
        Ok(Endpoint::tcp(s))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Tcp(addr.to_string())
    }
}

impl From<&Endpoint> for Endpoint {
    fn from(e: &Endpoint) -> Self {
        e.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for s in ["tcp://127.0.0.1:80", "udp://[::1]:9", "unix:///tmp/x.sock"] {
            let e: Endpoint = s.parse().unwrap();
            assert_eq!(e.to_string(), s);
        }
        assert_eq!("localhost:1".parse::<Endpoint>().unwrap(), Endpoint::tcp("localhost:1"));
        assert!("ftp://x".parse::<Endpoint>().is_err());
    }
}
