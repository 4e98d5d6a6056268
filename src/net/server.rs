use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use co_managed::Manager;
use may::net::{TcpListener, UdpSocket};
#[cfg(unix)]
use may::os::unix::net::UnixListener;
use may::sync::Mutex;
use may::{coroutine, go};
use may_waiter::TokenWaiter;

use super::endpoint::Endpoint;
use super::frame::{self, FRAME_PREFIX_LEN};
use super::stream_ext::{pipe, BoxStream};
use super::udp_client::MAX_DATAGRAM_LEN;
use crate::buffer::{self, Buffer};
use crate::codec::ResponseHeader;
use crate::errors::ErrorCode;
use crate::server::session::{Session, SessionAction};
use crate::server::{Outcome, RpcServer, ServerCore, Sweeper};
use crate::thread_pool::WorkerPool;

macro_rules! t {
    ($e: expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                error!("call = {:?}\nerr = {:?}", stringify!($e), err);
                continue;
            }
        }
    };
}

/// Worker threads and sweeper serving one [`ServerCore`].
pub(crate) struct Runtime {
    pub(crate) core: Arc<ServerCore>,
    pool: WorkerPool,
    sweeper: Mutex<Option<Sweeper>>,
    // a clone of every served stream, shut down on stop
    connections: Mutex<HashMap<u64, BoxStream>>,
}

/// Removes a connection from the registry when its coroutine ends.
struct Tracked<'a> {
    runtime: &'a Runtime,
    id: u64,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.runtime.connections.lock().unwrap().remove(&self.id);
    }
}

impl Runtime {
    pub(crate) fn launch(core: Arc<ServerCore>) -> io::Result<Self> {
        let config = &core.config;
        let pool = WorkerPool::new("wirecall-worker", config.threading, config.worker_idle_timeout)?;
        let sweeper = Sweeper::spawn(core.objects.clone(), config.sweep_interval)?;
        Ok(Runtime {
            core,
            pool,
            sweeper: Mutex::new(Some(sweeper)),
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn track(&self, id: u64, stream: &BoxStream) -> Tracked<'_> {
        match stream.try_clone() {
            Ok(s) => {
                self.connections.lock().unwrap().insert(id, s);
            }
            Err(e) => warn!("session {id}: can't be closed on shutdown, err={e}"),
        }
        Tracked { runtime: self, id }
    }

    /// number of connections currently served
    pub(crate) fn connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub(crate) fn worker_threads(&self) -> usize {
        self.pool.threads()
    }

    /// Runs the dispatch of `message` on a worker thread and waits for it.
    fn dispatch(&self, session: Session, message: Buffer) -> io::Result<(Session, Outcome)> {
        let waiter = TokenWaiter::new();
        let id: usize = match waiter.id() {
            Ok(id) => id.into(),
            Err(_) => return Err(io::Error::new(io::ErrorKind::Other, "no waiter id")),
        };
        let core = self.core.clone();
        self.pool.execute(move || {
            let mut session = session;
            let outcome = core.on_message(&mut session, message);
            let id = unsafe { may_waiter::ID::from_usize(id) };
            TokenWaiter::set_rsp(id, (session, outcome));
        })?;
        waiter.wait_rsp(None::<Duration>)
    }

    /// Sets the stop flag, drains the worker pool, stops the sweeper and
    /// shuts down every served stream, then waits up to the linger time for
    /// the connection coroutines to notice. Must run before those coroutines
    /// are cancelled, so that no worker still holds a waiter of a cancelled
    /// coroutine.
    pub(crate) fn shutdown(&self) {
        self.core.stop();
        self.pool.shutdown();
        self.sweeper.lock().unwrap().take();
        self.core.broker.close_all();
        for stream in self.connections.lock().unwrap().values() {
            stream.shutdown(Shutdown::Both).ok();
        }
        let deadline = Instant::now() + self.core.config.linger;
        while self.connections() > 0 && Instant::now() < deadline {
            coroutine::sleep(Duration::from_millis(5));
        }
    }
}

/// Connection states, one cycle per state.
#[derive(Debug)]
enum ConnState {
    Accepting,
    WritingData(Vec<Buffer>),
    ReadingDataCount,
    ReadingData(usize),
    Ready(Buffer),
    Closed,
}

struct Connection {
    runtime: Arc<Runtime>,
    stream: BoxStream,
    session: Option<Session>,
    buf: BytesMut,
}

/// Serves one stream connection until it closes or is handed over.
pub(crate) fn serve_connection(runtime: &Arc<Runtime>, stream: BoxStream) {
    let session = runtime.core.new_session(stream.peer());
    let _tracked = runtime.track(session.id, &stream);
    Connection {
        runtime: runtime.clone(),
        stream,
        session: Some(session),
        buf: BytesMut::with_capacity(1024 * 32),
    }
    .run()
}

/// Dispatches the oneway calls arriving on `stream` in place, replies are
/// never written.
pub(crate) fn serve_oneway(core: &ServerCore, mut stream: BoxStream) {
    let mut session = core.new_session(stream.peer());
    let mut buf = BytesMut::with_capacity(1024 * 32);
    loop {
        let message =
            match frame::read_frame(&mut stream, &mut buf, core.config.max_message_length) {
                Ok(m) => m,
                Err(ref e) => {
                    log_read_end(session.id, e);
                    break;
                }
            };
        if let Outcome::Close = core.on_message(&mut session, message) {
            break;
        }
    }
    stream.shutdown(Shutdown::Both).ok();
}

fn log_read_end(id: u64, e: &io::Error) {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        info!("session {id}: connection closed");
    } else {
        warn!("session {id}: read failed, err={e}");
    }
}

/// read and discard until EOF, error or timeout
fn drain(stream: &mut BoxStream) {
    let mut scratch = [0u8; 1024];
    while let Ok(n) = stream.read(&mut scratch) {
        if n == 0 {
            break;
        }
    }
}

/// cross-wire two connections until either side closes
fn reflect(stream: BoxStream, link: BoxStream) -> io::Result<()> {
    let back = (link.try_clone()?, stream.try_clone()?);
    let h = go!(move || pipe(back.0, back.1));
    let sent = pipe(stream, link);
    let received = h.join().unwrap_or(0);
    debug!("reflect finished, {sent} bytes out, {received} bytes back");
    Ok(())
}

impl Connection {
    fn id(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.id)
    }

    fn run(mut self) {
        let max_len = self.runtime.core.config.max_message_length;
        let mut state = ConnState::Accepting;
        loop {
            if self.runtime.core.is_stopping() {
                state = ConnState::Closed;
            }
            trace!("session {}: {state:?}", self.id());
            state = match state {
                ConnState::Accepting => {
                    info!("session {} accepted from {}", self.id(), self.stream.peer());
                    ConnState::WritingData(Vec::new())
                }
                ConnState::WritingData(data) => {
                    match frame::write_frame(&mut self.stream, &data) {
                        Err(e) => {
                            warn!("session {}: write failed, err={e}", self.id());
                            ConnState::Closed
                        }
                        Ok(()) => match self.session.as_mut().and_then(|s| s.action.take()) {
                            None => ConnState::ReadingDataCount,
                            Some(SessionAction::Close) => ConnState::Closed,
                            Some(action) => return self.hand_over(action),
                        },
                    }
                }
                ConnState::ReadingDataCount => match frame::read_len(&mut self.stream) {
                    Ok(len) if len > max_len => {
                        self.reject(len, max_len);
                        ConnState::Closed
                    }
                    Ok(len) => ConnState::ReadingData(len),
                    Err(ref e) => {
                        log_read_end(self.id(), e);
                        ConnState::Closed
                    }
                },
                ConnState::ReadingData(len) => {
                    match frame::read_body(&mut self.stream, len, &mut self.buf) {
                        Ok(message) => ConnState::Ready(message),
                        Err(ref e) => {
                            log_read_end(self.id(), e);
                            ConnState::Closed
                        }
                    }
                }
                ConnState::Ready(message) => match self.dispatch(message) {
                    Ok(Outcome::Reply(data)) => ConnState::WritingData(data),
                    Ok(Outcome::NoReply) => ConnState::WritingData(Vec::new()),
                    Ok(Outcome::Close) => ConnState::Closed,
                    Err(e) => {
                        error!("session {}: dispatch failed, err={e}", self.id());
                        ConnState::Closed
                    }
                },
                ConnState::Closed => {
                    self.stream.shutdown(Shutdown::Both).ok();
                    info!("session {} closed", self.id());
                    return;
                }
            };
        }
    }

    fn dispatch(&mut self, message: Buffer) -> io::Result<Outcome> {
        let session = self
            .session
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "session is in use"))?;
        let (session, outcome) = self.runtime.dispatch(session, message)?;
        self.session = Some(session);
        Ok(outcome)
    }

    /// Answers an oversized frame with one error frame, half-closes and
    /// discards whatever the peer still sends.
    fn reject(&mut self, len: usize, max_len: usize) {
        warn!(
            "session {}: message of {len} bytes exceeds the limit {max_len}",
            self.id()
        );
        let data = frame::error_frame(ResponseHeader::error(ErrorCode::SERVER_MESSAGE_LENGTH));
        if frame::write_frame(&mut self.stream, &data).is_err() {
            return;
        }
        self.stream.shutdown(Shutdown::Write).ok();
        let linger = self.runtime.core.config.linger;
        self.stream.set_read_timeout(Some(linger)).ok();
        drain(&mut self.stream);
    }

    fn hand_over(self, action: SessionAction) {
        let Connection {
            runtime,
            mut stream,
            session,
            ..
        } = self;
        let id = session.as_ref().map_or(0, |s| s.id);
        match action {
            SessionAction::Close => {
                stream.shutdown(Shutdown::Both).ok();
            }
            SessionAction::Park { name, password } => {
                info!("session {id} parked as endpoint {name}");
                runtime.core.broker.park(name, password, stream);
            }
            SessionAction::Reflect(link) => {
                info!("session {id} reflecting");
                if let Err(e) = reflect(stream, link) {
                    error!("session {id}: reflect failed, err={e}");
                }
            }
            SessionAction::Subscribe(topic) => {
                let topics = &runtime.core.topics;
                if topics.add(&topic, id, &stream) {
                    // nothing is read from a subscriber, wait for it to go
                    drain(&mut stream);
                    topics.remove(&topic, id);
                    info!("session {id} unsubscribed from {topic}");
                }
                stream.shutdown(Shutdown::Both).ok();
            }
        }
    }
}

fn datagram_message(datagram: &[u8], max_len: usize) -> Result<Buffer, ErrorCode> {
    if datagram.len() < FRAME_PREFIX_LEN {
        return Err(ErrorCode::DECODING);
    }
    let len = BigEndian::read_u32(&datagram[..FRAME_PREFIX_LEN]) as usize;
    if len > max_len {
        return Err(ErrorCode::SERVER_MESSAGE_LENGTH);
    }
    if len != datagram.len() - FRAME_PREFIX_LEN {
        return Err(ErrorCode::DECODING);
    }
    Ok(Buffer::copy_from_slice(&datagram[FRAME_PREFIX_LEN..]))
}

fn send_datagram(sock: &Mutex<UdpSocket>, data: &[Buffer], addr: SocketAddr) {
    let datagram = buffer::concat(data);
    debug!("send_to: len={} addr={addr}", datagram.len());
    // udp no need to protect by a mutex, each send would be one frame
    let s = sock.lock().unwrap();
    if let Err(e) = s.send_to(&datagram, addr) {
        error!("udp send_to failed, err={e}");
    }
}

type Started = (coroutine::JoinHandle<()>, Endpoint);

fn start_tcp(runtime: Arc<Runtime>, addr: &str) -> io::Result<Started> {
    let listener = TcpListener::bind(addr)?;
    let local = Endpoint::from(listener.local_addr()?);
    let handle = go!(
        coroutine::Builder::new().name("TcpServer".to_owned()),
        move || {
            let manager = Manager::new();
            for stream in listener.incoming() {
                let stream = t!(stream);
                if runtime.core.is_stopping() {
                    break;
                }
                t!(stream.set_nodelay(true));
                let runtime = runtime.clone();
                manager.add(move || serve_connection(&runtime, Box::new(stream)));
            }
        }
    )?;
    Ok((handle, local))
}

#[cfg(unix)]
fn start_uds(runtime: Arc<Runtime>, path: &Path) -> io::Result<Started> {
    struct AutoDrop(UnixListener, PathBuf);
    impl Drop for AutoDrop {
        fn drop(&mut self) {
            std::fs::remove_file(&self.1).ok();
        }
    }

    std::fs::remove_file(path).ok();
    let listener = AutoDrop(UnixListener::bind(path)?, path.to_owned());
    let handle = go!(
        coroutine::Builder::new().name("Unix Socket Server".to_owned()),
        move || {
            let manager = Manager::new();
            for stream in listener.0.incoming() {
                let stream = t!(stream);
                if runtime.core.is_stopping() {
                    break;
                }
                let runtime = runtime.clone();
                manager.add(move || serve_connection(&runtime, Box::new(stream)));
            }
        }
    )?;
    Ok((handle, Endpoint::Unix(path.to_owned())))
}

fn start_udp(runtime: Arc<Runtime>, addr: &str) -> io::Result<Started> {
    let sock = UdpSocket::bind(addr)?; // the write half
    let reader = sock.try_clone()?; // the read half
    let local = Endpoint::Udp(sock.local_addr()?.to_string());
    let handle = go!(
        coroutine::Builder::new().name("UdpServer".to_owned()),
        move || {
            // the write half need to be protected by mutex
            // for that coroutine io obj can't shared safely
            let sock = Arc::new(Mutex::new(sock));
            let max_len = runtime.core.config.max_message_length;
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                let (len, addr) = t!(reader.recv_from(&mut buf));
                if runtime.core.is_stopping() {
                    break;
                }
                debug!("recv_from: len={len} addr={addr}");

                let message = match datagram_message(&buf[..len], max_len) {
                    Ok(m) => m,
                    Err(code) => {
                        warn!("bad datagram from {addr}: {code}");
                        send_datagram(&sock, &frame::error_frame(ResponseHeader::error(code)), addr);
                        continue;
                    }
                };
                // every datagram is a session of its own, without filters
                let mut session = runtime.core.new_session(addr.to_string());
                let core = runtime.core.clone();
                let sock = sock.clone();
                let job = move || {
                    if let Outcome::Reply(data) = core.on_message(&mut session, message) {
                        send_datagram(&sock, &data, addr);
                    }
                };
                if let Err(e) = runtime.pool.execute(job) {
                    error!("udp dispatch failed, err={e}");
                }
            }
        }
    )?;
    Ok((handle, local))
}

impl RpcServer {
    /// Spawns the service, listening on `endpoint`. Port 0 picks a free
    /// port, see [`ServerInstance::local_endpoint`].
    pub fn start<E: Into<Endpoint>>(self, endpoint: E) -> io::Result<ServerInstance> {
        let endpoint = endpoint.into();
        let runtime = Arc::new(Runtime::launch(self.core)?);
        let (accept, local) = match &endpoint {
            Endpoint::Tcp(addr) => start_tcp(runtime.clone(), addr)?,
            Endpoint::Udp(addr) => start_udp(runtime.clone(), addr)?,
            #[cfg(unix)]
            Endpoint::Unix(path) => start_uds(runtime.clone(), path)?,
        };
        info!("server listening on {local}");
        Ok(ServerInstance {
            runtime,
            endpoint: local,
            accept: Some(accept),
            streams: Mutex::new(Vec::new()),
        })
    }
}

/// A running server; dropping it stops the service.
pub struct ServerInstance {
    runtime: Arc<Runtime>,
    endpoint: Endpoint,
    accept: Option<coroutine::JoinHandle<()>>,
    streams: Mutex<Vec<coroutine::JoinHandle<()>>>,
}

impl ServerInstance {
    /// the endpoint actually listened on
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// a handle for binding servants or opening topics while running
    pub fn server(&self) -> RpcServer {
        RpcServer {
            core: self.runtime.core.clone(),
        }
    }

    /// number of stream connections being served
    pub fn connections(&self) -> usize {
        self.runtime.connections()
    }

    /// number of live worker threads
    pub fn worker_threads(&self) -> usize {
        self.runtime.worker_threads()
    }

    /// serve an already established connection like an accepted one
    pub fn serve_stream(&self, stream: BoxStream) -> io::Result<()> {
        let runtime = self.runtime.clone();
        let name = format!("Connection {}", stream.peer());
        let h = go!(coroutine::Builder::new().name(name), move || {
            serve_connection(&runtime, stream)
        })?;
        self.streams.lock().unwrap().push(h);
        Ok(())
    }

    /// join the service, this would wait until the service is stopped
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(handle) = self.accept.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.runtime.shutdown();
        if let Some(s) = self.accept.take() {
            unsafe { s.coroutine().cancel() };
            s.join().ok();
        }
        let streams = std::mem::take(&mut *self.streams.lock().unwrap());
        for s in streams {
            unsafe { s.coroutine().cancel() };
            s.join().ok();
        }
        info!("server on {} stopped", self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_are_validated() {
        let mut d = vec![0, 0, 0, 2, 7, 8];
        assert_eq!(datagram_message(&d, 16).unwrap().as_slice(), &[7, 8]);
        assert_eq!(
            datagram_message(&d, 1).unwrap_err(),
            ErrorCode::SERVER_MESSAGE_LENGTH
        );
        d.push(9);
        assert_eq!(datagram_message(&d, 16).unwrap_err(), ErrorCode::DECODING);
        assert_eq!(datagram_message(&d[..3], 16).unwrap_err(), ErrorCode::DECODING);
    }
}
