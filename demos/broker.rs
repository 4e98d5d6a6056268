use std::time::Duration;

use wirecall::{Endpoint, EndpointServer, ErrorCode, RpcServer};

#[wirecall::interface]
pub trait Hello {
    fn hello(&self, name: String) -> String;
}

#[derive(wirecall::Servant)]
#[interface(Hello)]
struct HelloImpl;

impl Hello for HelloImpl {
    fn hello(&self, name: String) -> String {
        format!("Hello from behind the broker, {name}!")
    }
}

fn main() {
    env_logger::init();
    let broker_addr = Endpoint::tcp("127.0.0.1:4000");
    let broker = RpcServer::default();
    let _broker_instance = broker.clone().start(broker_addr.clone()).unwrap();

    // the endpoint server only dials out, it never listens
    let server = RpcServer::default();
    server.bind("hello", HelloImpl);
    let endpoint = EndpointServer::open(broker_addr.clone(), "room", "secret", server, 2).unwrap();
    println!("endpoint {} open", endpoint.name());

    let mut client = HelloClient::new(broker_addr, "hello");
    loop {
        match client.stub_mut().connect_endpoint("room", "secret") {
            Ok(()) => break,
            Err(e) if e.code() == ErrorCode::ENDPOINT_DOWN || e.code() == ErrorCode::UNKNOWN_ENDPOINT => {
                println!("links not parked yet: {e}");
                may::coroutine::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("connect_endpoint failed: {e}"),
        }
    }

    for i in 0..5 {
        println!("recv = {:?}", client.hello(format!("id={i}")));
    }
    println!("links parked: {}", broker.parked_links("room"));
}
