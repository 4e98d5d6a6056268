mod common;

use common::{echo_server, start, EchoClient};
use wirecall::filter::{self, AES_GCM_FILTER_ID, IDENTITY_FILTER_ID, ZLIB_FILTER_ID};
use wirecall::{ErrorCode, FilterChain, RpcServer, ServerConfig};

const KEY: [u8; 32] = [7; 32];

fn filtering_server() -> RpcServer {
    let server = echo_server(ServerConfig::default());
    server
        .register_filter(IDENTITY_FILTER_ID, || Ok(filter::identity()))
        .register_filter(ZLIB_FILTER_ID, || Ok(filter::zlib()))
        .register_filter(AES_GCM_FILTER_ID, || filter::aes_gcm(&KEY));
    server
}

fn zlib_aes() -> FilterChain {
    FilterChain::new(vec![filter::zlib(), filter::aes_gcm(&KEY).unwrap()]).unwrap()
}

#[test]
fn negotiated_chain_carries_calls() {
    common::init();
    let instance = start(&filtering_server());
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");

    client.stub_mut().request_filters(zlib_aes()).unwrap();
    assert_eq!(
        client.stub().filter_ids(),
        [ZLIB_FILTER_ID, AES_GCM_FILTER_ID]
    );
    assert_eq!(
        client.filter_ids().unwrap(),
        [ZLIB_FILTER_ID, AES_GCM_FILTER_ID]
    );

    let big = "compress me ".repeat(10_000);
    assert_eq!(client.echo(big.clone()).unwrap(), big);
    assert_eq!(client.add(20, 22).unwrap(), 42);

    // exceptions travel through the chain as well
    let e = client.fail("filtered".to_owned()).unwrap_err();
    assert_eq!(e.code(), ErrorCode::USER);
}

#[test]
fn reconnect_renegotiates() {
    common::init();
    let instance = start(&filtering_server());
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    client.stub_mut().request_filters(zlib_aes()).unwrap();
    let first = client.session_id().unwrap();

    client.stub_mut().disconnect();
    assert_eq!(client.echo("again".to_owned()).unwrap(), "again");
    assert_ne!(client.session_id().unwrap(), first);
    assert_eq!(
        client.filter_ids().unwrap(),
        [ZLIB_FILTER_ID, AES_GCM_FILTER_ID]
    );
}

#[test]
fn mismatch_then_recovery() {
    common::init();
    let instance = start(&filtering_server());
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");

    // installed locally only, the server session has no filters
    client
        .stub_mut()
        .set_filters(FilterChain::new(vec![filter::zlib()]).unwrap());
    let e = client.add(1, 2).unwrap_err();
    assert_eq!(e.code(), ErrorCode::PAYLOAD_FILTER_MISMATCH);

    client
        .stub_mut()
        .request_filters(FilterChain::new(vec![filter::zlib()]).unwrap())
        .unwrap();
    assert_eq!(client.add(1, 2).unwrap(), 3);
}

#[test]
fn unknown_filters_are_refused() {
    common::init();
    let server = echo_server(ServerConfig::default());
    server.register_filter(ZLIB_FILTER_ID, || Ok(filter::zlib()));
    let instance = start(&server);
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");

    assert!(client.stub_mut().query_filters(&[ZLIB_FILTER_ID]).unwrap());
    assert!(!client
        .stub_mut()
        .query_filters(&[ZLIB_FILTER_ID, AES_GCM_FILTER_ID])
        .unwrap());

    let e = client.stub_mut().request_filters(zlib_aes()).unwrap_err();
    assert_eq!(e.code(), ErrorCode::UNKNOWN_FILTER);
    // nothing was installed on either side
    assert!(client.stub().filter_ids().is_empty());
    assert_eq!(client.add(2, 3).unwrap(), 5);
    assert!(client.filter_ids().unwrap().is_empty());
}

#[test]
fn removing_filters() {
    common::init();
    let instance = start(&filtering_server());
    let mut client = EchoClient::new(instance.local_endpoint().clone(), "echo");
    client.stub_mut().request_filters(zlib_aes()).unwrap();
    client
        .stub_mut()
        .request_filters(FilterChain::default())
        .unwrap();
    assert!(client.filter_ids().unwrap().is_empty());
    assert_eq!(client.add(1, 1).unwrap(), 2);
}
