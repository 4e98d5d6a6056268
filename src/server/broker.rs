use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use may::sync::Mutex;
use may::{coroutine, go};

use super::session::{RequestContext, SessionAction};
use super::stub::{Call, Servant};
use super::RpcServer;
use crate::client::ClientStub;
use crate::errors::{Error, ErrorCode, RemoteException};
use crate::net::endpoint::Endpoint;
use crate::net::frame::RspBuf;
use crate::net::server::{serve_connection, Runtime};
use crate::net::stream_ext::BoxStream;

struct Parked {
    password: String,
    links: VecDeque<BoxStream>,
}

impl Parked {
    /// drop the links whose endpoint server went away
    fn prune(&mut self, name: &str) {
        let before = self.links.len();
        self.links.retain_mut(is_alive);
        let dead = before - self.links.len();
        if dead > 0 {
            info!("endpoint {name}: dropped {dead} dead links");
        }
    }
}

/// A parked link never sends anything; EOF or data both mean it is unusable.
fn is_alive(link: &mut BoxStream) -> bool {
    if link.set_read_timeout(Some(Duration::from_millis(1))).is_err() {
        return false;
    }
    let mut scratch = [0u8; 1];
    let alive = match link.read(&mut scratch) {
        Ok(_) => false,
        Err(e) => matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ),
    };
    alive && link.set_read_timeout(None).is_ok()
}

/// Connections parked under a name, waiting to be cross-wired.
#[derive(Default)]
pub(crate) struct Broker {
    endpoints: Mutex<HashMap<String, Parked>>,
}

impl Broker {
    fn check_password(&self, name: &str, password: &str) -> ErrorCode {
        match self.endpoints.lock().unwrap().get(name) {
            Some(parked) if parked.password != password => ErrorCode::ENDPOINT_PASSWORD,
            _ => ErrorCode::OK,
        }
    }

    /// park `link` under `name`
    pub(crate) fn park(&self, name: String, password: String, link: BoxStream) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let parked = endpoints.entry(name.clone()).or_insert_with(|| Parked {
            password,
            links: VecDeque::new(),
        });
        parked.prune(&name);
        parked.links.push_back(link);
    }

    /// take the oldest link parked under `name`
    fn claim(&self, name: &str, password: &str) -> Result<BoxStream, ErrorCode> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let parked = endpoints.get_mut(name).ok_or(ErrorCode::UNKNOWN_ENDPOINT)?;
        if parked.password != password {
            return Err(ErrorCode::ENDPOINT_PASSWORD);
        }
        parked.prune(name);
        parked.links.pop_front().ok_or(ErrorCode::ENDPOINT_DOWN)
    }

    /// number of live links parked under `name`
    pub(crate) fn parked(&self, name: &str) -> usize {
        let mut endpoints = self.endpoints.lock().unwrap();
        match endpoints.get_mut(name) {
            Some(parked) => {
                parked.prune(name);
                parked.links.len()
            }
            None => 0,
        }
    }

    /// shut down every parked link
    pub(crate) fn close_all(&self) {
        let endpoints = std::mem::take(&mut *self.endpoints.lock().unwrap());
        for link in endpoints.into_values().flat_map(|p| p.links) {
            link.shutdown(Shutdown::Both).ok();
        }
    }
}

/// Control servant of the endpoint broker.
///
/// Functions:
/// 0. `open_endpoint(name, password) -> code`, parks the caller's connection
/// 1. `connect_endpoint(name, password) -> code`, cross-wires the caller's
///    connection with a parked one
pub(crate) struct BrokerServant;

impl Servant for BrokerServant {
    fn invoke(
        &self,
        ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException> {
        let (name, password): (String, String) = call.decode_args()?;
        let broker = &ctx.core.broker;
        let code = match call.fn_id {
            0 => {
                let code = broker.check_password(&name, &password);
                if code == ErrorCode::OK {
                    info!("session {} parks as endpoint {name}", ctx.session.id);
                    ctx.set_action(SessionAction::Park { name, password });
                }
                code
            }
            1 => match broker.claim(&name, &password) {
                Ok(link) => {
                    info!("session {} connects to endpoint {name}", ctx.session.id);
                    ctx.set_action(SessionAction::Reflect(link));
                    ErrorCode::OK
                }
                Err(code) => code,
            },
            _ => return Err(call.unknown_fn()),
        };
        call.encode_result(rsp, &code.0)
    }
}

fn open_link(broker: &Endpoint, name: &str, password: &str) -> Result<BoxStream, Error> {
    let mut stub = ClientStub::new(broker.clone(), "");
    stub.open_endpoint(name, password)?;
    stub.into_stream().ok_or(Error::NotConnected)
}

/// A server reachable only through a broker.
///
/// Keeps a number of links parked at the broker; each link, once a client
/// connects through it, is served like an ordinary connection and replaced
/// by a new link when it closes.
pub struct EndpointServer {
    name: String,
    runtime: Arc<Runtime>,
    stop: Arc<AtomicBool>,
    links: Vec<coroutine::JoinHandle<()>>,
}

impl fmt::Debug for EndpointServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointServer")
            .field("name", &self.name)
            .field("links", &self.links.len())
            .finish()
    }
}

impl EndpointServer {
    /// Parks `connections` links at `broker` under `name` and serves the
    /// calls arriving over them with `server`.
    pub fn open<E: Into<Endpoint>>(
        broker: E,
        name: &str,
        password: &str,
        server: RpcServer,
        connections: usize,
    ) -> Result<Self, Error> {
        let broker = broker.into();
        let runtime = Arc::new(Runtime::launch(server.core)?);
        let stop = Arc::new(AtomicBool::new(false));
        let mut links = Vec::new();
        for i in 0..connections.max(1) {
            let link = open_link(&broker, name, password)?;
            let runtime = runtime.clone();
            let stop = stop.clone();
            let broker = broker.clone();
            let name = name.to_owned();
            let password = password.to_owned();
            let co_name = format!("EndpointLink-{name}-{i}");
            let h = go!(
                coroutine::Builder::new().name(co_name),
                move || {
                    let mut link = Some(link);
                    while !stop.load(Ordering::Acquire) {
                        let stream = match link.take() {
                            Some(s) => s,
                            None => match open_link(&broker, &name, &password) {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!("endpoint {name}: failed to open link, err={e}");
                                    coroutine::sleep(Duration::from_millis(500));
                                    continue;
                                }
                            },
                        };
                        serve_connection(&runtime, stream);
                    }
                }
            )?;
            links.push(h);
        }
        info!("endpoint {name} open at {broker}");
        Ok(EndpointServer {
            name: name.to_owned(),
            runtime,
            stop,
            links,
        })
    }

    /// the name the links are parked under
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EndpointServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // no worker may hand a response to a cancelled link
        self.runtime.shutdown();
        for h in self.links.drain(..) {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}
