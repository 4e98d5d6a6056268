mod common;

use std::time::Duration;

use common::{echo_server, start, EchoClient};
use wirecall::{EndpointServer, Error, ErrorCode, RpcServer, ServerConfig};

fn connect(client: &mut EchoClient, name: &str, password: &str) -> Result<(), Error> {
    // parking happens right after the open reply went out, retry until then
    for _ in 0..100 {
        match client.stub_mut().connect_endpoint(name, password) {
            Err(e) if e.code() == ErrorCode::ENDPOINT_DOWN => {
                std::thread::sleep(Duration::from_millis(20))
            }
            ret => return ret,
        }
    }
    client.stub_mut().connect_endpoint(name, password)
}

#[test]
fn calls_reach_the_endpoint_server() {
    common::init();
    let broker = RpcServer::default();
    let broker_instance = start(&broker);
    let broker_addr = broker_instance.local_endpoint().clone();

    let endpoint = EndpointServer::open(
        broker_addr.clone(),
        "room",
        "secret",
        echo_server(ServerConfig::default()),
        2,
    )
    .unwrap();
    assert_eq!(endpoint.name(), "room");
    common::wait_until("links parked", || broker.parked_links("room") == 2);

    let mut client = EchoClient::new(broker_addr.clone(), "echo");
    connect(&mut client, "room", "secret").unwrap();
    assert_eq!(client.add(2, 3).unwrap(), 5);
    assert_eq!(client.echo("via broker".to_owned()).unwrap(), "via broker");

    // the broker itself binds no "echo"
    let mut direct = EchoClient::new(broker_addr, "echo");
    assert_eq!(
        direct.add(1, 1).unwrap_err().code(),
        ErrorCode::NO_SERVER_STUB
    );

    // the claimed link is replaced once the client goes away
    client.stub_mut().disconnect();
    common::wait_until("link replaced", || broker.parked_links("room") == 2);
}

#[test]
fn reconnect_goes_through_the_broker_again() {
    common::init();
    let broker = RpcServer::default();
    let broker_instance = start(&broker);
    let broker_addr = broker_instance.local_endpoint().clone();
    let _endpoint = EndpointServer::open(
        broker_addr.clone(),
        "room",
        "secret",
        echo_server(ServerConfig::default()),
        2,
    )
    .unwrap();
    common::wait_until("links parked", || broker.parked_links("room") == 2);

    let mut client = EchoClient::new(broker_addr, "echo");
    connect(&mut client, "room", "secret").unwrap();
    assert_eq!(client.add(1, 2).unwrap(), 3);

    client.stub_mut().disconnect();
    common::wait_until("link available", || broker.parked_links("room") >= 1);
    assert_eq!(client.add(3, 4).unwrap(), 7);
}

#[test]
fn wrong_name_or_password() {
    common::init();
    let broker = RpcServer::default();
    let broker_instance = start(&broker);
    let broker_addr = broker_instance.local_endpoint().clone();
    let _endpoint = EndpointServer::open(
        broker_addr.clone(),
        "room",
        "secret",
        echo_server(ServerConfig::default()),
        1,
    )
    .unwrap();
    common::wait_until("link parked", || broker.parked_links("room") == 1);

    let mut client = EchoClient::new(broker_addr.clone(), "echo");
    let e = connect(&mut client, "room", "guess").unwrap_err();
    assert_eq!(e.code(), ErrorCode::ENDPOINT_PASSWORD);
    let e = connect(&mut client, "hall", "secret").unwrap_err();
    assert_eq!(e.code(), ErrorCode::UNKNOWN_ENDPOINT);
    assert_eq!(broker.parked_links("room"), 1);

    // a second endpoint server can't take the name with another password
    let e = EndpointServer::open(
        broker_addr,
        "room",
        "other",
        echo_server(ServerConfig::default()),
        1,
    )
    .unwrap_err();
    assert_eq!(e.code(), ErrorCode::ENDPOINT_PASSWORD);
}
