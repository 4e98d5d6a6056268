use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use may::sync::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::session::RequestContext;
use crate::errors::{ErrorCode, RemoteException};
use crate::net::frame::RspBuf;
use crate::serialize::SerializationProtocol;

/// One decoded invocation handed to a [`Servant`].
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    /// interface the caller targets
    pub sub_interface: &'a str,
    /// function index within the interface
    pub fn_id: i32,
    /// serialization of `args` and of the result
    pub protocol: SerializationProtocol,
    /// serialized arguments
    pub args: &'a [u8],
}

impl Call<'_> {
    /// deserialize the argument tuple
    pub fn decode_args<T: DeserializeOwned>(&self) -> Result<T, RemoteException> {
        self.protocol
            .deserialize(self.args)
            .map_err(|e| RemoteException::new(ErrorCode::DESERIALIZATION, e))
    }

    /// serialize a return value into the response
    pub fn encode_result<T: Serialize + ?Sized>(
        &self,
        rsp: &mut RspBuf,
        value: &T,
    ) -> Result<(), RemoteException> {
        self.protocol
            .serialize_into(rsp, value)
            .map_err(|e| RemoteException::new(ErrorCode::SERIALIZATION, e))
    }

    /// exception for an out of range function id
    pub fn unknown_fn(&self) -> RemoteException {
        RemoteException::new(
            ErrorCode::FN_ID,
            format!("{}: unknown function id {}", self.sub_interface, self.fn_id),
        )
    }
}

/// A server side object that calls are dispatched to.
pub trait Servant: Send + Sync + 'static {
    /// Executes one call. Results are serialized into `rsp`; an error is
    /// shipped back to the caller as an exception response.
    fn invoke(
        &self,
        ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException>;
}

impl<S: Servant + ?Sized> Servant for Arc<S> {
    fn invoke(
        &self,
        ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException> {
        (**self).invoke(ctx, call, rsp)
    }
}

/// A bound servant plus the time it was last used.
pub struct StubEntry {
    servant: Arc<dyn Servant>,
    last_touch: Mutex<Instant>,
}

impl fmt::Debug for StubEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubEntry")
            .field("idle", &self.idle_for())
            .finish()
    }
}

impl StubEntry {
    /// wrap a servant
    pub fn new(servant: Arc<dyn Servant>) -> Arc<Self> {
        Arc::new(StubEntry {
            servant,
            last_touch: Mutex::new(Instant::now()),
        })
    }

    /// the bound servant
    pub fn servant(&self) -> &Arc<dyn Servant> {
        &self.servant
    }

    /// mark the entry as used now
    pub fn touch(&self) {
        *self.last_touch.lock().unwrap() = Instant::now();
    }

    /// time since the last touch
    pub fn idle_for(&self) -> Duration {
        self.last_touch.lock().unwrap().elapsed()
    }
}
