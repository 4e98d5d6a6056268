//! wirecall is a remote call runtime built on coroutines. Calls travel as
//! length prefixed binary frames over TCP, Unix domain sockets or UDP, through
//! an optional chain of transformation filters (compression, encryption).
//!
//! ## Pieces
//! - [`ClientStub`] holds one connection and performs calls with a deadline,
//!   reconnecting and downgrading its runtime version as needed.
//! - [`RpcServer`] binds servants by name, leases objects under tokens,
//!   negotiates filters per session, brokers connections between parked
//!   endpoint servers and their clients, and pushes published calls to
//!   subscribers.
//! - `#[interface]` turns a trait into a typed client and a dispatcher;
//!   `#[derive(Servant)]` plugs an implementation into a server.
//!
//! Arguments and results are anything serde can serialize: bincode by
//! default, JSON on request.
//!
//! Example usage:
//!
//! ```rust,no_run
//! use wirecall::{interface, Endpoint, RpcServer, Servant};
//!
//! #[interface]
//! pub trait Hello {
//!     fn hello(&self, name: String) -> String;
//! }
//!
//! #[derive(Servant)]
//! #[interface(Hello)]
//! struct HelloImpl;
//!
//! impl Hello for HelloImpl {
//!     fn hello(&self, name: String) -> String {
//!         format!("Hello, {name}!")
//!     }
//! }
//!
//! fn main() -> Result<(), wirecall::Error> {
//!     let server = RpcServer::default();
//!     server.bind("hello", HelloImpl);
//!     let _instance = server.start(Endpoint::tcp("127.0.0.1:10000"))?;
//!
//!     let mut client = HelloClient::new(Endpoint::tcp("127.0.0.1:10000"), "hello");
//!     println!("{}", client.hello("Mom".to_string())?);
//!     Ok(())
//! }
//! ```
//!

#![warn(missing_docs)]

#[macro_use]
extern crate log;

extern crate self as wirecall;

pub extern crate bincode;
#[doc(hidden)]
pub extern crate may;
pub extern crate serde;

/// Version of the call protocol spoken by this runtime.
pub const RUNTIME_VERSION: i32 = 3;

/// Buffers sharing one allocation, with room for headers in front
pub mod buffer;
mod client;
/// Wire envelopes and the integer/string encoding under them
pub mod codec;
mod config;
mod errors;
/// Payload transformations negotiated per session
pub mod filter;
mod message;
pub mod net;
mod serialize;
mod server;
mod thread_pool;
mod token;

pub use buffer::Buffer;
pub use client::ClientStub;
pub use config::{ClientConfig, ServerConfig, DEFAULT_MAX_MESSAGE_LENGTH};
pub use errors::{Error, ErrorCode, RemoteException};
pub use filter::FilterChain;
pub use net::{BoxStream, Endpoint, ReqBuf, RspBuf, ServerInstance, StreamExt};
pub use serialize::SerializationProtocol;
pub use server::{
    Call, EndpointServer, Publisher, RequestContext, RpcServer, Servant, ServantFactory, Session,
    StubEntry, Subscription, BROKER_SERVICE, FACTORY_SERVICE, FILTER_SERVICE, PUBSUB_SERVICE,
};
pub use thread_pool::ThreadingModel;
pub use token::Token;
pub use wirecall_derive::{derive_serde, interface, Servant};
