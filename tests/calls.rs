mod common;

use std::io::{Read, Write};
use std::time::Duration;

use common::{echo_server, start, EchoClient};
use wirecall::{
    Buffer, ClientConfig, ClientStub, Endpoint, Error, ErrorCode, SerializationProtocol,
    ServerConfig,
};

fn tcp_addr(endpoint: &Endpoint) -> String {
    match endpoint {
        Endpoint::Tcp(addr) => addr.clone(),
        other => panic!("not a tcp endpoint: {other}"),
    }
}

#[test]
fn echo_round_trip() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");

    for i in 0..10 {
        let s = format!("Hello World! id={i}");
        assert_eq!(client.echo(s.clone()).unwrap(), s);
    }
    assert_eq!(client.add(40, 2).unwrap(), 42);
    assert!(client.stub().is_connected());

    // a large payload crosses several reads
    let big = "x".repeat(200_000);
    assert_eq!(client.echo(big.clone()).unwrap(), big);
}

#[test]
fn json_protocol() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    client.stub_mut().set_protocol(SerializationProtocol::Json);
    assert_eq!(client.add(1, 2).unwrap(), 3);
    let e = client.fail("json".to_owned()).unwrap_err();
    assert_eq!(e.code(), ErrorCode::USER);
}

#[test]
fn remote_errors_keep_the_connection() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    let session = client.session_id().unwrap();

    match client.fail("no luck".to_owned()).unwrap_err() {
        Error::Remote(e) => {
            assert_eq!(e.code, ErrorCode::USER);
            assert_eq!(e.message, "no luck");
            assert_eq!(e.type_name, "EchoError");
        }
        e => panic!("unexpected {e:?}"),
    }

    let e = client.boom().unwrap_err();
    assert_eq!(e.code(), ErrorCode::BAD_EXCEPTION);

    // still the same connection
    assert_eq!(client.session_id().unwrap(), session);
}

#[test]
fn unknown_targets() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let endpoint = instance.local_endpoint().clone();

    let mut stub = ClientStub::new(endpoint.clone(), "echo");
    stub.set_sub_interface("Echo");
    let e = stub.call::<_, ()>(99, &()).unwrap_err();
    assert_eq!(e.code(), ErrorCode::FN_ID);

    stub.set_sub_interface("Other");
    let e = stub.call::<_, ()>(0, &()).unwrap_err();
    assert_eq!(e.code(), ErrorCode::UNKNOWN_INTERFACE);

    let mut client = EchoClient::new(endpoint, "nobody");
    let e = client.add(1, 1).unwrap_err();
    assert_eq!(e.code(), ErrorCode::NO_SERVER_STUB);
}

#[test]
fn bad_arguments_are_a_deserialization_error() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut stub = ClientStub::new(instance.local_endpoint().clone(), "echo");
    stub.set_sub_interface("Echo");
    // add expects two i32
    let e = stub.call::<_, i32>(1, &(1u8,)).unwrap_err();
    assert_eq!(e.code(), ErrorCode::DESERIALIZATION);
}

#[test]
fn oneway_and_raw_calls() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut stub = ClientStub::new(instance.local_endpoint().clone(), "echo");
    stub.set_sub_interface("Echo");

    stub.call_oneway(1, &(1, 2)).unwrap();
    // the reply to the next call is not mixed up with the oneway call
    let sum: i32 = stub.call(1, &(3, 4)).unwrap();
    assert_eq!(sum, 7);

    let args = Buffer::from(wirecall::bincode::serialize(&(5, 6)).unwrap());
    let ret = stub.call_raw(1, &args, false).unwrap().unwrap();
    let sum: i32 = wirecall::bincode::deserialize(&ret).unwrap();
    assert_eq!(sum, 11);
    assert!(stub.call_raw(1, &args, true).unwrap().is_none());
}

#[test]
fn call_timeout_and_reconnect() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    client
        .stub_mut()
        .set_call_timeout(Duration::from_millis(200));

    let e = client.sleep(1000).unwrap_err();
    assert!(matches!(e, Error::ReadTimeout), "{e:?}");
    assert!(!client.stub().is_connected());

    // the late reply went to the dropped connection
    client.stub_mut().set_call_timeout(Duration::from_secs(5));
    assert_eq!(client.add(2, 2).unwrap(), 4);
}

#[test]
fn no_reconnect_when_disabled() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let config = ClientConfig {
        auto_reconnect: false,
        ..ClientConfig::default()
    };
    let stub = ClientStub::with_config(instance.local_endpoint().clone(), "echo", config);
    let mut client = EchoClient::from_stub(stub);
    assert_eq!(client.add(1, 1).unwrap(), 2);

    client.stub_mut().disconnect();
    let e = client.add(1, 1).unwrap_err();
    assert!(matches!(e, Error::NotConnected), "{e:?}");
}

#[test]
fn close_session() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    let first = client.session_id().unwrap();
    client.stub_mut().close_session().unwrap();
    assert!(!client.stub().is_connected());
    let second = client.session_id().unwrap();
    assert_ne!(first, second);
}

#[test]
fn oversized_frame_is_rejected() {
    common::init();
    let config = ServerConfig::default()
        .max_message_length(1024)
        .linger(Duration::from_millis(500));
    let instance = start(&echo_server(config));
    let addr = tcp_addr(instance.local_endpoint());

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(&[0, 0, 0x10, 0]).unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    // length 3, error descriptor, header version 0, ServerMessageLength
    assert_eq!(reply, [0, 0, 0, 3, 0, 0, 2]);
}

#[test]
fn oversized_response_is_refused_by_the_client() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    let config = ClientConfig {
        max_message_length: 1024,
        ..ClientConfig::default()
    };
    let stub = ClientStub::with_config(instance.local_endpoint().clone(), "echo", config);
    let mut client = EchoClient::from_stub(stub);
    let e = client.echo("y".repeat(4096)).unwrap_err();
    assert_eq!(e.code(), ErrorCode::CLIENT_MESSAGE_LENGTH);
    assert!(!client.stub().is_connected());
}

#[test]
fn bind_after_start() {
    common::init();
    let server = wirecall::RpcServer::default();
    let instance = start(&server);
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "late");
    assert_eq!(
        client.add(1, 1).unwrap_err().code(),
        ErrorCode::NO_SERVER_STUB
    );

    instance.server().bind("late", common::EchoImpl);
    assert_eq!(client.add(1, 1).unwrap(), 2);

    assert!(server.unbind("late"));
    assert_eq!(
        client.add(1, 1).unwrap_err().code(),
        ErrorCode::NO_SERVER_STUB
    );
}
