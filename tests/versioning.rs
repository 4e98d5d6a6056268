mod common;

use common::{echo_server, start, EchoClient};
use wirecall::{ClientConfig, ClientStub, Error, ServerConfig, RUNTIME_VERSION};

#[test]
fn client_downgrades_to_an_older_server() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default().runtime_version(2)));
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    assert_eq!(client.stub().runtime_version(), RUNTIME_VERSION);

    assert_eq!(client.add(1, 2).unwrap(), 3);
    assert_eq!(client.stub().runtime_version(), 2);
    assert_eq!(client.runtime_version().unwrap(), 2);
}

#[test]
fn downgrade_can_be_disabled() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default().runtime_version(2)));
    let config = ClientConfig {
        auto_versioning: false,
        ..ClientConfig::default()
    };
    let stub = ClientStub::with_config(instance.local_endpoint().clone(), "echo", config);
    let mut client = EchoClient::from_stub(stub);

    let e = client.add(1, 2).unwrap_err();
    assert!(matches!(e, Error::VersionMismatch(2)), "{e:?}");
    // the connection survives the refusal
    assert!(client.stub().is_connected());

    client.stub_mut().config_mut().runtime_version = 2;
    assert_eq!(client.add(1, 2).unwrap(), 3);
}

#[test]
fn older_clients_are_served() {
    common::init();
    let instance = start(&echo_server(ServerConfig::default()));
    for version in [1, 2] {
        let config = ClientConfig {
            runtime_version: version,
            ..ClientConfig::default()
        };
        let stub = ClientStub::with_config(instance.local_endpoint().clone(), "echo", config);
        let mut client = EchoClient::from_stub(stub);
        assert_eq!(client.runtime_version().unwrap(), version);
        assert_eq!(client.stub().runtime_version(), version);
    }
}
