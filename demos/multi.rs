use std::sync::atomic::{AtomicUsize, Ordering};

use wirecall::{Endpoint, RpcServer};

#[wirecall::interface]
trait RpcSpec {
    /// get current count
    fn get_count(&self) -> usize;
}

#[derive(wirecall::Servant)]
#[interface(RpcSpec)]
struct CountImpl(AtomicUsize);

impl RpcSpec for CountImpl {
    fn get_count(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

fn main() {
    env_logger::init();
    let addr = Endpoint::tcp("127.0.0.1:4000");
    let server = RpcServer::default();
    server.bind("count", CountImpl(AtomicUsize::new(0)));
    let _instance = server.start(addr.clone()).unwrap();

    let mut vec = vec![];
    for i in 0..100 {
        // calls on one stub are sequential, every coroutine gets its own
        let mut client = RpcSpecClient::new(addr.clone(), "count");
        let j = may::go!(move || {
            for _j in 0..1000 {
                if let Err(err) = client.get_count() {
                    println!("recv err = {err:?}");
                }
            }
            println!("thread done, id={i}");
        });
        vec.push(j);
    }

    for (i, j) in vec.into_iter().enumerate() {
        j.join().unwrap();
        println!("wait for {i} done");
    }
}
