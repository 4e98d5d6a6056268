use std::fmt;
use std::mem;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::buffer::Buffer;
use crate::codec::{RequestHeader, ResponseHeader};
use crate::config::ClientConfig;
use crate::errors::{Error, ErrorCode, RemoteException};
use crate::filter::FilterChain;
use crate::message;
use crate::net::client::ClientTransport;
use crate::net::endpoint::Endpoint;
use crate::net::frame::ReqBuf;
use crate::net::stream_ext::BoxStream;
use crate::serialize::SerializationProtocol;
use crate::server::{BROKER_SERVICE, FACTORY_SERVICE, FILTER_SERVICE, PUBSUB_SERVICE};
use crate::token::Token;

/// errors after which the connection can't be trusted to be in sync
fn breaks_connection(e: &Error) -> bool {
    !matches!(
        e,
        Error::Remote(_)
            | Error::VersionMismatch(_)
            | Error::ClientSerialize(_)
            | Error::ClientDeserialize(_)
    )
}

fn check_code(code: i32) -> Result<(), Error> {
    match ErrorCode(code) {
        ErrorCode::OK => Ok(()),
        code => Err(Error::Remote(RemoteException::from_code(code))),
    }
}

/// Client side call stub: one connection to one target object.
///
/// A call connects on demand, writes the request, waits for the response
/// and decodes it, all bounded by a deadline computed when the call starts.
/// Calls on one stub are strictly sequential.
pub struct ClientStub {
    endpoint: Endpoint,
    config: ClientConfig,
    service: String,
    sub_interface: String,
    token: Token,
    transport: Option<Box<dyn ClientTransport>>,
    filters: FilterChain,
    renegotiate: bool,
    reflected: Option<(String, String)>,
}

impl fmt::Debug for ClientStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStub")
            .field("endpoint", &self.endpoint)
            .field("service", &self.service)
            .field("token", &self.token)
            .field("connected", &self.is_connected())
            .field("filters", &self.filters)
            .finish()
    }
}

impl ClientStub {
    /// stub calling `service` at `endpoint` with the default configuration
    pub fn new<E: Into<Endpoint>>(endpoint: E, service: &str) -> Self {
        ClientStub::with_config(endpoint, service, ClientConfig::default())
    }

    /// stub with an explicit configuration
    pub fn with_config<E: Into<Endpoint>>(endpoint: E, service: &str, config: ClientConfig) -> Self {
        ClientStub {
            endpoint: endpoint.into(),
            config,
            service: service.to_owned(),
            sub_interface: String::new(),
            token: Token::none(),
            transport: None,
            filters: FilterChain::default(),
            renegotiate: false,
            reflected: None,
        }
    }

    /// the target endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// the stub configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// mutable access to the configuration, applies to the next call
    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// set the bound on a whole call
    pub fn set_call_timeout(&mut self, timeout: std::time::Duration) {
        self.config.call_timeout = timeout;
    }

    /// set the serialization of arguments and results
    pub fn set_protocol(&mut self, protocol: SerializationProtocol) {
        self.config.protocol = protocol;
    }

    /// runtime version currently announced, lowered by auto versioning
    pub fn runtime_version(&self) -> i32 {
        self.config.runtime_version
    }

    /// the target service name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// the target interface, the service name unless set
    pub fn sub_interface(&self) -> &str {
        if self.sub_interface.is_empty() {
            &self.service
        } else {
            &self.sub_interface
        }
    }

    /// target a specific interface of the service
    pub fn set_sub_interface(&mut self, sub_interface: &str) {
        self.sub_interface = sub_interface.to_owned();
    }

    /// the leased object targeted, `Token::none()` for the bound service
    pub fn token(&self) -> Token {
        self.token
    }

    /// target a leased object
    pub fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    /// ids of the installed filters
    pub fn filter_ids(&self) -> Vec<i32> {
        self.filters.ids()
    }

    /// true while a connection is held
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// connect now instead of on the first call
    pub fn connect(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.call_timeout;
        let ret = self.ensure_connected(deadline);
        if ret.is_err() {
            self.disconnect();
        }
        ret
    }

    /// drop the connection, the next call reconnects
    pub fn disconnect(&mut self) {
        if let Some(t) = self.transport.as_mut() {
            t.disconnect();
        }
    }

    /// Asks the server to close the session and drops the connection.
    pub fn close_session(&mut self) -> Result<(), Error> {
        if !self.is_connected() {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.call_timeout;
        let mut header = self.header(None, 0, true);
        header.close = true;
        let ret = self.round_trip(&header, &Buffer::default(), deadline);
        self.disconnect();
        ret.map(|_| ())
    }

    /// Gives up the connection, for reuse as a raw stream.
    pub fn into_stream(mut self) -> Option<BoxStream> {
        self.transport.take()?.into_stream()
    }

    fn ensure_connected(&mut self, deadline: Instant) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        if self.transport.is_some() && !self.config.auto_reconnect {
            return Err(Error::NotConnected);
        }
        let connect_deadline = deadline.min(Instant::now() + self.config.connect_timeout);
        let endpoint = &self.endpoint;
        let transport = self
            .transport
            .get_or_insert_with(|| endpoint.client_transport());
        transport.connect(connect_deadline)?;

        // the server side state of the last connection is gone, restore it
        // with unfiltered control calls
        let chain = mem::take(&mut self.filters);
        let ret = self.restore_session(&chain, deadline);
        self.filters = chain;
        ret
    }

    fn restore_session(&mut self, chain: &FilterChain, deadline: Instant) -> Result<(), Error> {
        if let Some((name, password)) = self.reflected.clone() {
            let code: i32 =
                self.control_round_trip(BROKER_SERVICE, 1, &(name, password), deadline)?;
            check_code(code)?;
        }
        if self.renegotiate {
            let code: i32 =
                self.control_round_trip(FILTER_SERVICE, 0, &(chain.ids(),), deadline)?;
            check_code(code)?;
        }
        Ok(())
    }

    fn header(&self, control: Option<&str>, fn_id: i32, oneway: bool) -> RequestHeader {
        let mut header = match control {
            Some(service) => RequestHeader::new(service, Token::none(), service, fn_id),
            None => RequestHeader::new(&self.service, self.token, self.sub_interface(), fn_id),
        }
        .runtime_version(self.config.runtime_version);
        header.protocol = self.config.protocol.id();
        header.oneway = oneway;
        header
    }

    fn serialize<A: Serialize + ?Sized>(&self, args: &A) -> Result<Buffer, Error> {
        let mut req = ReqBuf::new();
        self.config
            .protocol
            .serialize_into(&mut req, args)
            .map_err(Error::ClientSerialize)?;
        Ok(req.finish())
    }

    fn deserialize<R: DeserializeOwned>(&self, ret: Option<Buffer>) -> Result<R, Error> {
        let data = ret.ok_or_else(|| Error::Decoding("missing response".to_owned()))?;
        self.config
            .protocol
            .deserialize(&data)
            .map_err(Error::ClientDeserialize)
    }

    /// Writes one request and, unless oneway, reads its response. Drops the
    /// connection on any error that leaves it out of sync.
    fn round_trip(
        &mut self,
        header: &RequestHeader,
        payload: &Buffer,
        deadline: Instant,
    ) -> Result<Option<Buffer>, Error> {
        let ret = self.exchange(header, payload, deadline);
        if let Err(ref e) = ret {
            if breaks_connection(e) {
                warn!("call to {} failed, disconnecting: {e}", self.endpoint);
                self.disconnect();
            }
        }
        ret
    }

    fn exchange(
        &mut self,
        header: &RequestHeader,
        payload: &Buffer,
        deadline: Instant,
    ) -> Result<Option<Buffer>, Error> {
        self.ensure_connected(deadline)?;
        let data = message::encode_request(header, payload, &mut self.filters)?;
        let max_len = self.config.max_message_length;
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        transport.send(&data, deadline)?;
        if header.oneway {
            return Ok(None);
        }
        let rsp = transport.receive(deadline, max_len)?;
        let (rsp_header, body) = message::decode_response(rsp, &mut self.filters)?;
        match rsp_header {
            ResponseHeader::Return => Ok(Some(body)),
            ResponseHeader::Exception => {
                let e: RemoteException = self
                    .config
                    .protocol
                    .deserialize(&body)
                    .map_err(Error::ClientDeserialize)?;
                Err(Error::Remote(e))
            }
            ResponseHeader::Error {
                code: ErrorCode::VERSION_MISMATCH,
                arg,
            } => Err(Error::VersionMismatch(arg)),
            ResponseHeader::Error { code, .. } => {
                Err(Error::Remote(RemoteException::from_code(code)))
            }
        }
    }

    fn control_round_trip<A: Serialize, R: DeserializeOwned>(
        &mut self,
        service: &str,
        fn_id: i32,
        args: &A,
        deadline: Instant,
    ) -> Result<R, Error> {
        let payload = self.serialize(args)?;
        let header = self.header(Some(service), fn_id, false);
        let ret = self.round_trip(&header, &payload, deadline)?;
        self.deserialize(ret)
    }

    /// One call with the single downgrade-and-retry on an older server.
    fn invoke(
        &mut self,
        control: Option<&str>,
        fn_id: i32,
        payload: &Buffer,
        oneway: bool,
    ) -> Result<Option<Buffer>, Error> {
        let deadline = Instant::now() + self.config.call_timeout;
        let mut retries = 0;
        loop {
            let header = self.header(control, fn_id, oneway);
            match self.round_trip(&header, payload, deadline) {
                Err(Error::VersionMismatch(version))
                    if retries == 0
                        && self.config.auto_versioning
                        && version < self.config.runtime_version =>
                {
                    info!(
                        "{} runs runtime version {version}, downgrading from {}",
                        self.endpoint, self.config.runtime_version
                    );
                    self.config.runtime_version = version;
                    retries += 1;
                }
                ret => return ret,
            }
        }
    }

    /// Calls function `fn_id` of the target with the argument tuple `args`.
    pub fn call<A, R>(&mut self, fn_id: i32, args: &A) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self.serialize(args)?;
        let ret = self.invoke(None, fn_id, &payload, false)?;
        self.deserialize(ret)
    }

    /// Sends a call without waiting for any response.
    pub fn call_oneway<A: Serialize + ?Sized>(&mut self, fn_id: i32, args: &A) -> Result<(), Error> {
        let payload = self.serialize(args)?;
        self.invoke(None, fn_id, &payload, true).map(|_| ())
    }

    /// Calls with an already serialized payload; returns the raw result
    /// payload, `None` for oneway calls.
    pub fn call_raw(
        &mut self,
        fn_id: i32,
        payload: &Buffer,
        oneway: bool,
    ) -> Result<Option<Buffer>, Error> {
        self.invoke(None, fn_id, payload, oneway)
    }

    fn control_call<A: Serialize, R: DeserializeOwned>(
        &mut self,
        service: &str,
        fn_id: i32,
        args: &A,
    ) -> Result<R, Error> {
        let payload = self.serialize(args)?;
        let ret = self.invoke(Some(service), fn_id, &payload, false)?;
        self.deserialize(ret)
    }

    /// Negotiates `chain` with the server and installs it. Requests are sent
    /// through the chain from then on, and it is renegotiated on reconnect.
    pub fn request_filters(&mut self, chain: FilterChain) -> Result<(), Error> {
        let ids = chain.ids();
        self.filters = FilterChain::default();
        self.renegotiate = false;
        let code: i32 = self.control_call(FILTER_SERVICE, 0, &(ids.clone(),))?;
        check_code(code)?;
        info!("filters {ids:?} negotiated with {}", self.endpoint);
        self.renegotiate = !chain.is_empty();
        self.filters = chain;
        Ok(())
    }

    /// Installs `chain` locally without telling the server.
    pub fn set_filters(&mut self, chain: FilterChain) {
        self.filters = chain;
    }

    /// true if the server can install every filter in `ids`
    pub fn query_filters(&mut self, ids: &[i32]) -> Result<bool, Error> {
        let chain = mem::take(&mut self.filters);
        let ret: Result<i32, Error> = self.control_call(FILTER_SERVICE, 1, &(ids.to_vec(),));
        self.filters = chain;
        Ok(ret? == ErrorCode::OK.0)
    }

    /// Creates an object through the server factory `name` and targets it.
    pub fn create_remote_object(&mut self, name: &str) -> Result<Token, Error> {
        let (code, token): (i32, i32) = self.control_call(FACTORY_SERVICE, 0, &(name,))?;
        check_code(code)?;
        self.token = Token::new(token);
        Ok(self.token)
    }

    /// Deletes the targeted object and targets the bound service again.
    pub fn delete_remote_object(&mut self) -> Result<(), Error> {
        let token = self.token.id();
        let code: i32 = self.control_call(FACTORY_SERVICE, 1, &(token,))?;
        self.token = Token::none();
        check_code(code)
    }

    /// Creates an object owned by this connection's session; calls without
    /// token or service name reach it.
    pub fn create_remote_session_object(&mut self, name: &str) -> Result<(), Error> {
        let code: i32 = self.control_call(FACTORY_SERVICE, 2, &(name,))?;
        check_code(code)
    }

    /// drop the session object
    pub fn delete_remote_session_object(&mut self) -> Result<(), Error> {
        let code: i32 = self.control_call(FACTORY_SERVICE, 3, &())?;
        check_code(code)
    }

    /// Routes this connection through the broker to the endpoint server
    /// parked under `name`. Reconnects repeat it.
    pub fn connect_endpoint(&mut self, name: &str, password: &str) -> Result<(), Error> {
        let chain = mem::take(&mut self.filters);
        let ret: Result<i32, Error> = self.control_call(BROKER_SERVICE, 1, &(name, password));
        self.filters = chain;
        check_code(ret?)?;
        self.reflected = Some((name.to_owned(), password.to_owned()));
        Ok(())
    }

    /// park this connection at the broker under `name`
    pub(crate) fn open_endpoint(&mut self, name: &str, password: &str) -> Result<(), Error> {
        let code: i32 = self.control_call(BROKER_SERVICE, 0, &(name, password))?;
        check_code(code)
    }

    /// turn this connection into a push channel for `topic`
    pub(crate) fn subscribe_topic(&mut self, topic: &str) -> Result<(), Error> {
        let code: i32 = self.control_call(PUBSUB_SERVICE, 0, &(topic,))?;
        check_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn headers_follow_the_target() {
        let mut stub = ClientStub::new(Endpoint::tcp("127.0.0.1:1"), "Echo");
        let header = stub.header(None, 3, false);
        assert_eq!(header.service, "Echo");
        assert_eq!(header.sub_interface, "Echo");
        assert_eq!(header.fn_id, 3);
        assert_eq!(header.runtime_version, crate::RUNTIME_VERSION);

        stub.set_sub_interface("EchoV2");
        stub.set_token(Token::new(7));
        let header = stub.header(None, 0, true);
        assert_eq!(header.sub_interface, "EchoV2");
        assert_eq!(header.token, Token::new(7));
        assert!(header.oneway);

        let header = stub.header(Some(FACTORY_SERVICE), 1, false);
        assert_eq!(header.service, FACTORY_SERVICE);
        assert!(header.token.is_none());
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        let mut stub = ClientStub::new(Endpoint::tcp("127.0.0.1:1"), "Echo");
        let e = stub.call::<_, String>(0, &("hi",)).unwrap_err();
        assert!(e.is_transport(), "{e:?}");
        assert!(!stub.is_connected());
    }

    #[test]
    fn connect_is_bounded_by_the_call_timeout() {
        // blackholed on most networks, refused at once where there is no route
        let mut stub = ClientStub::new(Endpoint::tcp("10.255.255.1:81"), "Echo");
        stub.set_call_timeout(Duration::from_millis(300));
        let start = Instant::now();
        let e = stub.call::<_, String>(0, &("hi",)).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
        assert!(
            matches!(e, Error::ConnectTimeout(_) | Error::ConnectFail(..)),
            "{e:?}"
        );
        assert!(!stub.is_connected());
    }

    #[test]
    fn error_codes_become_remote_errors() {
        assert!(check_code(0).is_ok());
        let e = check_code(ErrorCode::UNKNOWN_FILTER.0).unwrap_err();
        assert_eq!(e.code(), ErrorCode::UNKNOWN_FILTER);
    }
}
