use std::time::Duration;

use wirecall::{Endpoint, RpcServer};

mod test_hello_bar;
mod test_hello_foo;

fn test_foo() {
    use test_hello_foo::{HelloClient, HelloService};
    let addr = Endpoint::tcp("127.0.0.1:4000");

    let server = RpcServer::default();
    server.bind("hello", HelloService);
    let instance = server.start(addr.clone()).unwrap();

    let mut client = HelloClient::new(addr, "hello");
    client.stub_mut().set_call_timeout(Duration::from_millis(500));

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        let data = client.echo(s);
        println!("recv = {data:?}");
    }

    for i in 0..10 {
        let data = client.add(i, i);
        println!("recv = {data:?}");
    }

    drop(instance);
}

fn test_bar() {
    use test_hello_bar::{HelloClient, HelloService};
    let addr = Endpoint::tcp("127.0.0.1:4001");

    let server = RpcServer::default();
    server.bind("hello", HelloService);
    let instance = server.start(addr.clone()).unwrap();

    let mut client = HelloClient::new(addr, "hello");
    client.stub_mut().set_call_timeout(Duration::from_millis(500));

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        let data = client.echo(s);
        println!("recv = {data:?}");
    }

    for i in 0..10 {
        let data = client.add(i, i);
        println!("recv = {data:?}");
    }

    println!("div = {:?}", client.div(10, 2));
    println!("div = {:?}", client.div(10, 0));
    println!("session = {:?}", client.whoami());
    client.note("bye".to_owned()).unwrap();

    drop(instance);
}

fn main() {
    env_logger::init();
    may::config().set_workers(2);

    test_foo();
    test_bar();
}
