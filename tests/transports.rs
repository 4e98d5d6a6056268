mod common;

use std::time::Duration;

use common::{echo_server, start, EchoClient};
use wirecall::filter::{self, ZLIB_FILTER_ID};
use wirecall::{Endpoint, ErrorCode, FilterChain, ServerConfig};

#[cfg(unix)]
#[test]
fn unix_socket() {
    common::init();
    let path = std::env::temp_dir().join(format!("wirecall-{}.sock", std::process::id()));
    let server = echo_server(ServerConfig::default());
    server.register_filter(ZLIB_FILTER_ID, || Ok(filter::zlib()));
    let instance = server.start(Endpoint::unix(&path)).unwrap();
    assert_eq!(instance.local_endpoint(), &Endpoint::unix(&path));

    let mut client = EchoClient::new(Endpoint::unix(&path), "echo");
    assert_eq!(client.add(1, 2).unwrap(), 3);
    client
        .stub_mut()
        .request_filters(FilterChain::new(vec![filter::zlib()]).unwrap())
        .unwrap();
    let big = "abc".repeat(50_000);
    assert_eq!(client.echo(big.clone()).unwrap(), big);

    // the client still holds its connection
    assert_eq!(instance.connections(), 1);
    assert!(common::drops_within(instance, Duration::from_secs(5)));
    assert!(!path.exists());
    assert!(client.add(1, 2).unwrap_err().is_transport());
}

#[test]
fn udp_datagrams() {
    common::init();
    let server = echo_server(ServerConfig::default());
    let instance = server.start(Endpoint::udp("127.0.0.1:0")).unwrap();
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    client.stub_mut().set_call_timeout(Duration::from_secs(2));

    for i in 0..10 {
        assert_eq!(client.add(i, i).unwrap(), 2 * i);
    }
    assert_eq!(client.echo("datagram".to_owned()).unwrap(), "datagram");
    let e = client.fail("over udp".to_owned()).unwrap_err();
    assert_eq!(e.code(), ErrorCode::USER);

    // every datagram is a session of its own
    let a = client.session_id().unwrap();
    let b = client.session_id().unwrap();
    assert_ne!(a, b);
}

#[test]
fn serve_accepted_stream() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));

    // a connection established outside the server
    let listener = may::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = std::thread::spawn(move || listener.accept().map(|(s, _)| s));

    let mut client = EchoClient::new(Endpoint::from(addr), "echo");
    client.stub_mut().connect().unwrap();
    let stream = accept.join().unwrap().unwrap();
    instance.serve_stream(Box::new(stream)).unwrap();

    assert_eq!(client.add(20, 22).unwrap(), 42);
}

#[test]
fn dropping_the_server_closes_live_connections() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    assert!(instance.worker_threads() >= 1);
    let endpoint = instance.local_endpoint().clone();

    let mut clients: Vec<_> = (0..3).map(|_| EchoClient::new(endpoint.clone(), "echo")).collect();
    for c in &mut clients {
        assert_eq!(c.add(1, 1).unwrap(), 2);
    }
    common::wait_until("connections", || instance.connections() == 3);

    assert!(common::drops_within(instance, Duration::from_secs(5)));
    for c in &mut clients {
        assert!(c.add(1, 1).unwrap_err().is_transport());
    }
}

#[test]
fn closed_connections_leave_the_registry() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    assert_eq!(client.add(2, 2).unwrap(), 4);
    assert_eq!(instance.connections(), 1);

    client.stub_mut().disconnect();
    common::wait_until("connection closed", || instance.connections() == 0);
}
