use std::fmt;
use std::sync::Arc;

use super::stub::{Servant, StubEntry};
use super::ServerCore;
use crate::codec::RequestHeader;
use crate::filter::FilterChain;
use crate::net::stream_ext::BoxStream;
use crate::token::Token;

/// What happens to a connection once the current response is written.
pub(crate) enum SessionAction {
    /// close the connection
    Close,
    /// hand the connection to the broker under a name
    Park { name: String, password: String },
    /// cross-wire the connection with a parked one
    Reflect(BoxStream),
    /// turn the connection into a push channel for a topic
    Subscribe(String),
}

impl fmt::Debug for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionAction::Close => f.write_str("Close"),
            SessionAction::Park { name, .. } => write!(f, "Park({name})"),
            SessionAction::Reflect(_) => f.write_str("Reflect"),
            SessionAction::Subscribe(topic) => write!(f, "Subscribe({topic})"),
        }
    }
}

/// Per-connection state, owned by whoever is processing the connection.
#[derive(Debug)]
pub struct Session {
    pub(crate) id: u64,
    pub(crate) peer: String,
    pub(crate) filters: FilterChain,
    pub(crate) filtered: bool,
    pub(crate) cached_stub: Option<Arc<StubEntry>>,
    pub(crate) default_stub: Option<Arc<StubEntry>>,
    pub(crate) runtime_version: i32,
    pub(crate) action: Option<SessionAction>,
}

impl Session {
    pub(crate) fn new(id: u64, peer: String, runtime_version: i32) -> Self {
        Session {
            id,
            peer,
            filters: FilterChain::default(),
            filtered: false,
            cached_stub: None,
            default_stub: None,
            runtime_version,
            action: None,
        }
    }

    /// connection id, unique within a server
    pub fn id(&self) -> u64 {
        self.id
    }

    /// remote address, as far as the transport knows it
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// runtime version negotiated with the peer
    pub fn runtime_version(&self) -> i32 {
        self.runtime_version
    }

    /// ids of the installed filters
    pub fn filter_ids(&self) -> Vec<i32> {
        self.filters.ids()
    }
}

/// Everything a servant may look at or change while handling one call.
pub struct RequestContext<'a> {
    pub(crate) core: &'a ServerCore,
    pub(crate) session: &'a mut Session,
    pub(crate) request: &'a RequestHeader,
}

impl<'a> RequestContext<'a> {
    /// the decoded request envelope
    pub fn request(&self) -> &RequestHeader {
        self.request
    }

    /// the leased token the call was addressed to
    pub fn token(&self) -> Token {
        self.request.token
    }

    /// the calling connection
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Binds `servant` as the session default, used for calls that carry
    /// neither a token nor a service name.
    pub fn set_default_servant<S: Servant>(&mut self, servant: S) {
        self.session.default_stub = Some(StubEntry::new(Arc::new(servant)));
    }

    /// close the connection once the response is written
    pub fn close_session(&mut self) {
        self.session.action = Some(SessionAction::Close);
    }

    pub(crate) fn set_action(&mut self, action: SessionAction) {
        self.session.action = Some(action);
    }
}
