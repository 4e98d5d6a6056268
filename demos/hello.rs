use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use wirecall::{Endpoint, RpcServer};

#[wirecall::interface]
pub trait Hello {
    /// Say hello
    fn hello(&self, name: String) -> String;
    /// add two number
    fn add(&self, x: u32, y: u32) -> u32;
}

mod count {
    #[wirecall::interface]
    pub trait Count {
        /// get current count
        fn get_count(&self) -> usize;
    }
}

/// one servant answering both interfaces
#[derive(wirecall::Servant)]
#[interface(Hello, count::Count)]
struct HelloImpl(AtomicUsize);

impl Hello for HelloImpl {
    fn hello(&self, name: String) -> String {
        format!("Hello, {name}!")
    }

    fn add(&self, x: u32, y: u32) -> u32 {
        x + y
    }
}

impl count::Count for HelloImpl {
    fn get_count(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

fn main() {
    env_logger::init();
    may::config().set_workers(2).set_io_workers(4);

    // one message per datagram
    let addr = Endpoint::udp("127.0.0.1:4000");
    let server = RpcServer::default();
    server.bind("hello", HelloImpl(AtomicUsize::new(0)));
    let _instance = server.start(addr.clone()).unwrap();

    println!("test_hello");
    let mut client = HelloClient::new(addr.clone(), "hello");
    client.stub_mut().set_call_timeout(Duration::from_millis(500));
    for i in 0..10 {
        let s = format!("World id={i}");
        println!("recv = {:?}", client.hello(s));
    }
    for i in 0..10 {
        println!("recv = {:?}", client.add(i, i));
    }

    println!("\n\ntest_count");
    let mut client = count::CountClient::new(addr, "hello");
    for _ in 0..10 {
        println!("recv = {:?}", client.get_count());
    }
}
