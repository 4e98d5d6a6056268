//! Server side: bound servants, leased objects and the dispatcher that
//! routes each decoded request to one of them.

mod broker;
mod negotiation;
mod objects;
mod pubsub;
pub(crate) mod session;
mod stub;

pub use broker::EndpointServer;
pub use pubsub::{Publisher, Subscription};
pub use session::{RequestContext, Session};
pub use stub::{Call, Servant, StubEntry};

pub(crate) use objects::Sweeper;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use may::sync::RwLock;

use crate::buffer::Buffer;
use crate::codec::{RequestHeader, ResponseHeader};
use crate::config::ServerConfig;
use crate::errors::{Error, ErrorCode, RemoteException};
use crate::filter::{Filter, FilterRegistry};
use crate::message;
use crate::net::frame::{self, RspBuf};
use crate::serialize::SerializationProtocol;
use broker::{Broker, BrokerServant};
use negotiation::FilterServant;
use objects::{FactoryServant, ObjectTable};
use pubsub::{PubSubServant, Topics};

/// service name of filter negotiation
pub const FILTER_SERVICE: &str = "__wirecall_filters";
/// service name of the object factory
pub const FACTORY_SERVICE: &str = "__wirecall_factory";
/// service name of the endpoint broker
pub const BROKER_SERVICE: &str = "__wirecall_broker";
/// service name of publish/subscribe
pub const PUBSUB_SERVICE: &str = "__wirecall_pubsub";

/// Builds a fresh servant for `create_object`.
pub type ServantFactory = Arc<dyn Fn() -> Arc<dyn Servant> + Send + Sync>;

/// What the connection does after a message was dispatched.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// write this frame
    Reply(Vec<Buffer>),
    /// oneway call, nothing to write
    NoReply,
    /// close the connection
    Close,
}

fn error_reply(code: ErrorCode) -> Outcome {
    Outcome::Reply(frame::error_frame(ResponseHeader::error(code)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "servant panicked".to_owned()
    }
}

/// State shared by every connection of a server.
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    stubs: RwLock<HashMap<String, Arc<StubEntry>>>,
    factories: RwLock<HashMap<String, ServantFactory>>,
    pub(crate) objects: Arc<ObjectTable>,
    pub(crate) filters: RwLock<FilterRegistry>,
    pub(crate) broker: Broker,
    pub(crate) topics: Arc<Topics>,
    stopping: AtomicBool,
    next_session: AtomicU64,
}

impl ServerCore {
    fn new(config: ServerConfig) -> Self {
        let objects = ObjectTable::new(
            config.token_count,
            config.object_timeout,
            config.sweep_threshold,
        );
        let mut stubs = HashMap::new();
        let control: [(&str, Arc<dyn Servant>); 4] = [
            (FILTER_SERVICE, Arc::new(FilterServant)),
            (FACTORY_SERVICE, Arc::new(FactoryServant)),
            (BROKER_SERVICE, Arc::new(BrokerServant)),
            (PUBSUB_SERVICE, Arc::new(PubSubServant)),
        ];
        for (name, servant) in control {
            stubs.insert(name.to_owned(), StubEntry::new(servant));
        }
        ServerCore {
            config,
            stubs: RwLock::new(stubs),
            factories: RwLock::new(HashMap::new()),
            objects: Arc::new(objects),
            filters: RwLock::new(FilterRegistry::default()),
            broker: Broker::default(),
            topics: Arc::new(Topics::default()),
            stopping: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
        }
    }

    pub(crate) fn new_session(&self, peer: String) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(id, peer, self.config.runtime_version)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn make_servant(&self, name: &str) -> Option<Arc<dyn Servant>> {
        let factory = self.factories.read().unwrap().get(name).cloned()?;
        Some(factory())
    }

    /// Handles one complete message read from the connection of `session`.
    pub(crate) fn on_message(&self, session: &mut Session, message: Buffer) -> Outcome {
        session.action = None;
        match self.handle(session, message) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("session {} from {}: {e}, closing", session.id, session.peer);
                Outcome::Close
            }
        }
    }

    fn version_mismatch(&self) -> Outcome {
        Outcome::Reply(frame::error_frame(ResponseHeader::Error {
            code: ErrorCode::VERSION_MISMATCH,
            arg: self.config.runtime_version,
        }))
    }

    fn handle(&self, session: &mut Session, message: Buffer) -> Result<Outcome, Error> {
        let (clear, filtered) = match message::unwrap_filtered(message, &mut session.filters) {
            Ok(r) => r,
            Err(Error::PayloadFilterMismatch) => {
                warn!("session {}: payload filters do not match", session.id);
                return Ok(error_reply(ErrorCode::PAYLOAD_FILTER_MISMATCH));
            }
            Err(e @ Error::Filter { .. }) if !session.filters.is_critical() => {
                warn!("session {}: {e}", session.id);
                return Ok(error_reply(ErrorCode::FILTER));
            }
            Err(e) => return Err(e),
        };
        session.filtered = filtered;

        let mut pos = 0;
        let request = match RequestHeader::decode(&clear, &mut pos) {
            Ok(r) => r,
            Err(Error::HeaderVersion(v)) => {
                warn!("session {}: unsupported header version {v}", session.id);
                return Ok(self.version_mismatch());
            }
            Err(e) => return Err(e),
        };
        if request.runtime_version > self.config.runtime_version
            && !request.ignore_runtime_version
        {
            warn!(
                "session {}: runtime version {} is newer than {}",
                session.id, request.runtime_version, self.config.runtime_version
            );
            return Ok(self.version_mismatch());
        }
        session.runtime_version = request.runtime_version.min(self.config.runtime_version);
        if request.close {
            debug!("session {}: close requested", session.id);
            return Ok(Outcome::Close);
        }

        let args = clear.slice_from(pos);
        let protocol = SerializationProtocol::from_id(request.protocol);
        let result = match &protocol {
            Ok(p) => self.invoke(session, &request, *p, &args),
            Err(e) => Err(RemoteException::new(e.code(), e.to_string())),
        };
        if request.oneway {
            if let Err(e) = result {
                debug!("session {}: oneway call failed, {e}", session.id);
            }
            return Ok(Outcome::NoReply);
        }

        let body = match result {
            Ok(rsp) => rsp.finish(ResponseHeader::Return),
            Err(e) => {
                let mut rsp = RspBuf::new();
                protocol
                    .unwrap_or_default()
                    .serialize_into(&mut rsp, &e)
                    .map_err(Error::Encoding)?;
                rsp.finish(ResponseHeader::Exception)
            }
        };
        let filters = session.filtered.then_some(&mut session.filters);
        Ok(Outcome::Reply(message::encode_response(body, filters)?))
    }

    /// token, then service name, then the session default
    fn locate_stub(
        &self,
        session: &Session,
        request: &RequestHeader,
    ) -> Result<Arc<StubEntry>, RemoteException> {
        if !request.token.is_none() {
            return self.objects.lookup(request.token).ok_or_else(|| {
                RemoteException::new(
                    ErrorCode::DYNAMIC_OBJECT_NOT_FOUND,
                    format!("no object leased under token {}", request.token),
                )
            });
        }
        if !request.service.is_empty() {
            return self
                .stubs
                .read()
                .unwrap()
                .get(&request.service)
                .cloned()
                .ok_or_else(|| {
                    RemoteException::new(
                        ErrorCode::NO_SERVER_STUB,
                        format!("no servant bound as {:?}", request.service),
                    )
                });
        }
        session
            .default_stub
            .clone()
            .ok_or_else(|| RemoteException::new(ErrorCode::NO_SERVER_STUB, "no session object"))
    }

    fn invoke(
        &self,
        session: &mut Session,
        request: &RequestHeader,
        protocol: SerializationProtocol,
        args: &Buffer,
    ) -> Result<RspBuf, RemoteException> {
        let entry = self.locate_stub(session, request)?;
        entry.touch();
        session.cached_stub = Some(entry.clone());

        let call = Call {
            sub_interface: &request.sub_interface,
            fn_id: request.fn_id,
            protocol,
            args: args.as_slice(),
        };
        let mut rsp = RspBuf::new();
        let mut ctx = RequestContext {
            core: self,
            session,
            request,
        };
        let ret = panic::catch_unwind(AssertUnwindSafe(|| {
            entry.servant().invoke(&mut ctx, &call, &mut rsp)
        }));
        entry.touch();
        match ret {
            Ok(Ok(())) => Ok(rsp),
            Ok(Err(e)) => Err(e),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("{}::{} panicked: {msg}", request.sub_interface, request.fn_id);
                Err(RemoteException::new(ErrorCode::BAD_EXCEPTION, msg))
            }
        }
    }
}

/// A server's bindings and configuration. Clones share them, so a clone
/// kept before [`RpcServer::start`] can still bind servants afterwards.
#[derive(Clone)]
pub struct RpcServer {
    pub(crate) core: Arc<ServerCore>,
}

impl Default for RpcServer {
    fn default() -> Self {
        RpcServer::new(ServerConfig::default())
    }
}

impl RpcServer {
    /// create a server without bound servants
    pub fn new(config: ServerConfig) -> Self {
        RpcServer {
            core: Arc::new(ServerCore::new(config)),
        }
    }

    /// the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    /// Binds `servant` under `name`, replacing any previous binding.
    pub fn bind<S: Servant>(&self, name: &str, servant: S) -> &Self {
        let entry = StubEntry::new(Arc::new(servant));
        self.core
            .stubs
            .write()
            .unwrap()
            .insert(name.to_owned(), entry);
        self
    }

    /// remove the binding of `name`, false if there was none
    pub fn unbind(&self, name: &str) -> bool {
        self.core.stubs.write().unwrap().remove(name).is_some()
    }

    /// make `name` creatable through `create_object`
    pub fn register_factory<S, F>(&self, name: &str, factory: F) -> &Self
    where
        S: Servant,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let factory: ServantFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Servant>);
        self.core
            .factories
            .write()
            .unwrap()
            .insert(name.to_owned(), factory);
        self
    }

    /// make filter `id` negotiable
    pub fn register_filter<F>(&self, id: i32, factory: F) -> &Self
    where
        F: Fn() -> Result<Box<dyn Filter>, Error> + Send + Sync + 'static,
    {
        self.core.filters.write().unwrap().register(id, factory);
        self
    }

    /// number of leased objects
    pub fn object_count(&self) -> usize {
        self.core.objects.len()
    }

    /// links parked at the broker under `name`
    pub fn parked_links(&self, name: &str) -> usize {
        self.core.broker.parked(name)
    }

    /// run the idle sweep now, returns the number of reclaimed objects
    pub fn sweep_objects(&self) -> usize {
        self.core.objects.sweep()
    }

    /// open `topic` for subscriptions
    pub fn publisher(&self, topic: &str) -> Publisher {
        Publisher::new(
            self.core.topics.clone(),
            topic,
            self.core.config.runtime_version,
        )
    }
}
