//! Transports: framing, client connections and the server side connection
//! state machine over TCP, Unix domain sockets and UDP.

/// client side transports
pub mod client;
/// listen and connect addresses
pub mod endpoint;
/// raw frame protocol
pub mod frame;
pub(crate) mod queued_writer;
/// Provides server framework
pub(crate) mod server;
pub(crate) mod stream_ext;
/// Provides udp client
pub(crate) mod udp_client;

pub use client::{ClientTransport, StreamTransport};
pub use endpoint::Endpoint;
pub use frame::{ReqBuf, RspBuf};
pub use queued_writer::QueuedWriter;
pub use server::ServerInstance;
pub use stream_ext::{pipe, BoxStream, StreamExt};
pub use udp_client::{UdpTransport, MAX_DATAGRAM_LEN};
