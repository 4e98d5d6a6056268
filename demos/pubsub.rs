use std::time::Duration;

use wirecall::{Endpoint, RpcServer, Subscription};

/// topics double as interface names
#[wirecall::interface]
pub trait Ticker {
    #[oneway]
    fn tick(&self, n: u32);
}

#[derive(wirecall::Servant)]
#[interface(Ticker)]
struct Printer;

impl Ticker for Printer {
    fn tick(&self, n: u32) {
        println!("tick {n}");
    }
}

fn main() {
    env_logger::init();
    let addr = Endpoint::tcp("127.0.0.1:4000");
    let server = RpcServer::default();
    let _instance = server.clone().start(addr.clone()).unwrap();
    let publisher = server.publisher("Ticker");

    let subscriptions: Vec<_> = (0..3)
        .map(|_| Subscription::subscribe(addr.clone(), "Ticker", Printer).unwrap())
        .collect();
    // the push channel is registered once the subscribe reply went out
    while publisher.subscribers() < subscriptions.len() {
        may::coroutine::sleep(Duration::from_millis(10));
    }

    for n in 0..5u32 {
        let delivered = publisher.publish(0, &(n,)).unwrap();
        println!("published tick {n} to {delivered} subscribers");
    }
    may::coroutine::sleep(Duration::from_millis(200));

    drop(publisher);
    may::coroutine::sleep(Duration::from_millis(100));
    for s in &subscriptions {
        println!("{} connected: {}", s.topic(), s.is_connected());
    }
}
