use std::collections::HashMap;
use std::fmt;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use may::sync::Mutex;
use may::{coroutine, go};
use serde::Serialize;

use super::session::{RequestContext, SessionAction};
use super::stub::{Call, Servant};
use super::RpcServer;
use crate::buffer;
use crate::client::ClientStub;
use crate::codec::RequestHeader;
use crate::config::ServerConfig;
use crate::errors::{Error, ErrorCode, RemoteException};
use crate::filter::FilterChain;
use crate::message;
use crate::net::endpoint::Endpoint;
use crate::net::frame::{ReqBuf, RspBuf};
use crate::net::queued_writer::QueuedWriter;
use crate::net::server::serve_oneway;
use crate::net::stream_ext::BoxStream;
use crate::serialize::SerializationProtocol;
use crate::token::Token;

struct Subscriber {
    session: u64,
    writer: Arc<QueuedWriter<BoxStream>>,
    closer: BoxStream,
}

/// Subscribed push channels by topic.
#[derive(Default)]
pub(crate) struct Topics {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Topics {
    fn open(&self, topic: &str) {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default();
    }

    fn close(&self, topic: &str) {
        if let Some(subscribers) = self.topics.lock().unwrap().remove(topic) {
            for s in subscribers {
                s.closer.shutdown(Shutdown::Both).ok();
            }
        }
    }

    fn contains(&self, topic: &str) -> bool {
        self.topics.lock().unwrap().contains_key(topic)
    }

    /// register the connection of `session` as a push channel
    pub(crate) fn add(&self, topic: &str, session: u64, stream: &BoxStream) -> bool {
        let (writer, closer) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(w), Ok(c)) => (w, c),
            (Err(e), _) | (_, Err(e)) => {
                error!("subscriber {session} of {topic}: failed to clone stream, err={e}");
                return false;
            }
        };
        let mut topics = self.topics.lock().unwrap();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        subscribers.push(Subscriber {
            session,
            writer: Arc::new(QueuedWriter::new(writer)),
            closer,
        });
        info!("session {session} subscribed to {topic}");
        true
    }

    /// drop the push channel of `session`
    pub(crate) fn remove(&self, topic: &str, session: u64) {
        if let Some(subscribers) = self.topics.lock().unwrap().get_mut(topic) {
            subscribers.retain(|s| s.session != session);
        }
    }

    fn writers(&self, topic: &str) -> Vec<(u64, Arc<QueuedWriter<BoxStream>>)> {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|s| (s.session, s.writer.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Control servant for subscriptions.
///
/// Functions:
/// 0. `subscribe(topic) -> code`, turns the caller's connection into a push
///    channel once the response is written
pub(crate) struct PubSubServant;

impl Servant for PubSubServant {
    fn invoke(
        &self,
        ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException> {
        if call.fn_id != 0 {
            return Err(call.unknown_fn());
        }
        let (topic,): (String,) = call.decode_args()?;
        let code = if ctx.core.topics.contains(&topic) {
            ctx.set_action(SessionAction::Subscribe(topic));
            ErrorCode::OK
        } else {
            ErrorCode::UNKNOWN_PUBLISHER
        };
        call.encode_result(rsp, &code.0)
    }
}

/// Sends oneway calls to every subscriber of a topic.
///
/// Dropping the publisher closes the topic and disconnects its subscribers.
pub struct Publisher {
    topics: Arc<Topics>,
    topic: String,
    protocol: SerializationProtocol,
    runtime_version: i32,
}

impl Publisher {
    pub(crate) fn new(topics: Arc<Topics>, topic: &str, runtime_version: i32) -> Self {
        topics.open(topic);
        Publisher {
            topics,
            topic: topic.to_owned(),
            protocol: SerializationProtocol::default(),
            runtime_version,
        }
    }

    /// the published topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// serialization used for published arguments
    pub fn set_protocol(&mut self, protocol: SerializationProtocol) {
        self.protocol = protocol;
    }

    /// number of live subscribers
    pub fn subscribers(&self) -> usize {
        self.topics.writers(&self.topic).len()
    }

    /// Sends `fn_id(args)` to every subscriber. Returns how many got it;
    /// subscribers whose connection failed are dropped.
    pub fn publish<A: Serialize>(&self, fn_id: i32, args: &A) -> Result<usize, Error> {
        let mut req = ReqBuf::new();
        self.protocol
            .serialize_into(&mut req, args)
            .map_err(Error::ClientSerialize)?;
        let mut header = RequestHeader::new(&self.topic, Token::none(), &self.topic, fn_id)
            .runtime_version(self.runtime_version);
        header.oneway = true;
        header.protocol = self.protocol.id();
        let frame = message::encode_request(&header, &req.finish(), &mut FilterChain::default())?;
        let data = buffer::concat(&frame).to_vec();

        let mut delivered = 0;
        for (session, writer) in self.topics.writers(&self.topic) {
            match writer.write(data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    info!("dropping subscriber {session} of {}, err={e}", self.topic);
                    self.topics.remove(&self.topic, session);
                }
            }
        }
        debug!("published {} fn {fn_id} to {delivered} subscribers", self.topic);
        Ok(delivered)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.topics.close(&self.topic);
    }
}

/// A subscriber side push channel; calls arriving on it are dispatched to
/// the given servant.
pub struct Subscription {
    topic: String,
    closer: BoxStream,
    connected: Arc<AtomicBool>,
    handle: Option<coroutine::JoinHandle<()>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Subscription {
    /// Connects to `endpoint` and subscribes to `topic`.
    pub fn subscribe<E, S>(endpoint: E, topic: &str, servant: S) -> Result<Self, Error>
    where
        E: Into<Endpoint>,
        S: Servant,
    {
        let mut stub = ClientStub::new(endpoint, "");
        stub.subscribe_topic(topic)?;
        let stream = stub.into_stream().ok_or(Error::NotConnected)?;
        let closer = stream.try_clone()?;

        let server = RpcServer::new(ServerConfig::default().token_count(0));
        server.bind(topic, servant);
        let core = server.core;
        let connected = Arc::new(AtomicBool::new(true));
        let alive = connected.clone();
        let handle = go!(
            coroutine::Builder::new().name(format!("Subscription {topic}")),
            move || {
                serve_oneway(&core, stream);
                alive.store(false, Ordering::Release);
            }
        )?;
        Ok(Subscription {
            topic: topic.to_owned(),
            closer,
            connected,
            handle: Some(handle),
        })
    }

    /// the subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// false once the publisher went away
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closer.shutdown(Shutdown::Both).ok();
        if let Some(h) = self.handle.take() {
            h.join().ok();
        }
    }
}
