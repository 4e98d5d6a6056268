#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use wirecall::{Endpoint, RemoteException, RequestContext, RpcServer, ServerInstance};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// polls `f` until it holds, panics after a few seconds
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// drops `instance` on another thread, false if that didn't finish in time
pub fn drops_within(instance: ServerInstance, limit: Duration) -> bool {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        drop(instance);
        tx.send(()).ok();
    });
    rx.recv_timeout(limit).is_ok()
}

pub fn start(server: &RpcServer) -> ServerInstance {
    server
        .clone()
        .start(Endpoint::tcp("127.0.0.1:0"))
        .expect("start server")
}

#[wirecall::interface]
pub trait Echo {
    fn echo(&self, data: String) -> String;
    fn add(&self, x: i32, y: i32) -> i32;
    fn fail(&self, message: String) -> Result<(), RemoteException>;
    fn boom(&self);
    fn sleep(&self, ms: u64);
    fn session_id(&self, ctx: &mut RequestContext<'_>) -> u64;
    fn runtime_version(&self, ctx: &mut RequestContext<'_>) -> i32;
    fn filter_ids(&self, ctx: &mut RequestContext<'_>) -> Vec<i32>;
}

#[derive(wirecall::Servant)]
#[interface(Echo)]
pub struct EchoImpl;

impl Echo for EchoImpl {
    fn echo(&self, data: String) -> String {
        data
    }

    fn add(&self, x: i32, y: i32) -> i32 {
        x + y
    }

    fn fail(&self, message: String) -> Result<(), RemoteException> {
        Err(RemoteException::user(message).with_type_name("EchoError"))
    }

    fn boom(&self) {
        panic!("boom")
    }

    fn sleep(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn session_id(&self, ctx: &mut RequestContext<'_>) -> u64 {
        ctx.session().id()
    }

    fn runtime_version(&self, ctx: &mut RequestContext<'_>) -> i32 {
        ctx.session().runtime_version()
    }

    fn filter_ids(&self, ctx: &mut RequestContext<'_>) -> Vec<i32> {
        ctx.session().filter_ids()
    }
}

#[wirecall::interface]
pub trait Counter {
    fn increment(&self, by: i64) -> i64;
    fn value(&self) -> i64;
}

#[derive(wirecall::Servant, Default)]
#[interface(Counter)]
pub struct CounterImpl(AtomicI64);

impl Counter for CounterImpl {
    fn increment(&self, by: i64) -> i64 {
        self.0.fetch_add(by, Ordering::Relaxed) + by
    }

    fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// a server with `EchoImpl` bound as "echo" and `CounterImpl` creatable as
/// "Counter"
pub fn echo_server(config: wirecall::ServerConfig) -> RpcServer {
    let server = RpcServer::new(config);
    server.bind("echo", EchoImpl);
    server.register_factory("Counter", CounterImpl::default);
    server
}
