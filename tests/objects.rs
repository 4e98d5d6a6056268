mod common;

use std::time::Duration;

use common::{echo_server, start, CounterClient};
use wirecall::{ErrorCode, ServerConfig};

#[test]
fn leased_objects_keep_their_state() {
    common::init();
    let server = echo_server(ServerConfig::default());
    let instance = start(&server);
    let endpoint = instance.local_endpoint().clone();

    let mut a = CounterClient::new(endpoint.clone(), "");
    let mut b = CounterClient::new(endpoint, "");
    let ta = a.stub_mut().create_remote_object("Counter").unwrap();
    let tb = b.stub_mut().create_remote_object("Counter").unwrap();
    assert_ne!(ta, tb);
    assert_eq!(server.object_count(), 2);

    assert_eq!(a.increment(5).unwrap(), 5);
    assert_eq!(a.increment(5).unwrap(), 10);
    assert_eq!(b.increment(1).unwrap(), 1);
    assert_eq!(a.value().unwrap(), 10);

    a.stub_mut().delete_remote_object().unwrap();
    assert!(a.stub().token().is_none());
    assert_eq!(server.object_count(), 1);

    a.stub_mut().set_token(ta);
    assert_eq!(
        a.value().unwrap_err().code(),
        ErrorCode::DYNAMIC_OBJECT_NOT_FOUND
    );
    assert_eq!(b.value().unwrap(), 1);
}

#[test]
fn unknown_factory() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = CounterClient::new(instance.local_endpoint().clone(), "");
    let e = client
        .stub_mut()
        .create_remote_object("Nothing")
        .unwrap_err();
    assert_eq!(e.code(), ErrorCode::OBJECT_FACTORY_NOT_FOUND);
}

#[test]
fn token_exhaustion() {
    common::init();
    let server = echo_server(ServerConfig::default().token_count(2).sweep_threshold(1.0));
    let instance = start(&server);
    let mut client = CounterClient::new(instance.local_endpoint().clone(), "");

    client.stub_mut().create_remote_object("Counter").unwrap();
    client.stub_mut().create_remote_object("Counter").unwrap();
    let e = client
        .stub_mut()
        .create_remote_object("Counter")
        .unwrap_err();
    assert_eq!(e.code(), ErrorCode::TOKEN_REQUEST_FAILED);

    client.stub_mut().delete_remote_object().unwrap();
    client.stub_mut().create_remote_object("Counter").unwrap();
}

#[test]
fn idle_objects_are_swept() {
    common::init();
    let server = echo_server(
        ServerConfig::default()
            .object_timeout(Duration::from_millis(50))
            .sweep_interval(Duration::from_secs(3600)),
    );
    let instance = start(&server);
    let mut client = CounterClient::new(instance.local_endpoint().clone(), "");
    client.stub_mut().create_remote_object("Counter").unwrap();
    assert_eq!(client.increment(1).unwrap(), 1);

    // the session still refers to the object
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.sweep_objects(), 0);

    // once the connection is gone the object is only idle
    client.stub_mut().disconnect();
    common::wait_until("object reclaimed", || {
        server.sweep_objects();
        server.object_count() == 0
    });
    assert_eq!(
        client.value().unwrap_err().code(),
        ErrorCode::DYNAMIC_OBJECT_NOT_FOUND
    );
}

#[test]
fn session_objects() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let endpoint = instance.local_endpoint().clone();
    let mut client = CounterClient::new(endpoint.clone(), "");

    assert_eq!(
        client.value().unwrap_err().code(),
        ErrorCode::NO_SERVER_STUB
    );
    client
        .stub_mut()
        .create_remote_session_object("Counter")
        .unwrap();
    assert_eq!(client.increment(3).unwrap(), 3);
    assert_eq!(client.increment(3).unwrap(), 6);

    // other connections have their own session
    let mut other = CounterClient::new(endpoint, "");
    assert_eq!(
        other.value().unwrap_err().code(),
        ErrorCode::NO_SERVER_STUB
    );

    client.stub_mut().delete_remote_session_object().unwrap();
    assert_eq!(
        client.value().unwrap_err().code(),
        ErrorCode::NO_SERVER_STUB
    );
}
