#[macro_use]
extern crate may;

use std::time::Instant;

use wirecall::{Endpoint, RpcServer};

#[wirecall::interface]
trait RpcSpec {
    fn ack(&self);
}

#[derive(wirecall::Servant)]
#[interface(RpcSpec)]
struct Server;

impl RpcSpec for Server {
    fn ack(&self) {}
}

fn main() {
    env_logger::init();
    may::config().set_workers(2).set_io_workers(2);
    let addr = Endpoint::tcp("127.0.0.1:4000");
    let server = RpcServer::default();
    server.bind("ack", Server);
    let instance = server.start(addr.clone()).unwrap();

    let mut vec = vec![];
    let now = Instant::now();
    for _i in 0..100 {
        let mut client = RpcSpecClient::new(addr.clone(), "ack");
        let h = go!(move || {
            for _j in 0..10000 {
                if let Err(err) = client.ack() {
                    println!("recv err = {err:?}");
                }
            }
        });
        vec.push(h);
    }

    for h in vec {
        h.join().unwrap();
    }

    let dur = now.elapsed().as_secs_f32();
    println!("{} rpc/second", 1_000_000.0 / dur);

    drop(instance);
}
