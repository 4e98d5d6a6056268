//! Bidirectional transform stages between the message codec and the wire.
//!
//! A [`FilterChain`] owns its stages in a `Vec`; stage 0 sits next to the
//! application and the last stage next to the wire. Stages never call each
//! other. Each operation receives a [`Link`] through which it posts events
//! to its neighbours, and the chain pumps those events in order:
//!
//! * `Link::write` / `Link::read` travel toward the wire
//! * `Link::write_completed` / `Link::read_completed` travel toward the
//!   application
//!
//! The chain ends in two proxies. The wire proxy collects filtered output
//! or serves filtered input, the application proxy counts completions.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::buffer::{self, Buffer};
use crate::errors::{Error, ErrorCode};

mod aead;
mod block;
mod identity;
mod zlib;

pub use aead::{AesGcmCodec, AES_GCM_KEY_LEN};
pub use block::{BlockCodec, BlockFilter};
pub use identity::IdentityFilter;
pub use zlib::ZlibCodec;

/// maximum number of stages in one chain
pub const MAX_FILTERS: usize = 10;

/// id of the pass-through filter
pub const IDENTITY_FILTER_ID: i32 = 1;
/// id of the zlib compression filter
pub const ZLIB_FILTER_ID: i32 = 3;
/// id of the AES-256-GCM encryption filter
pub const AES_GCM_FILTER_ID: i32 = 4;

/// Static metadata identifying a filter type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDescription {
    /// display name
    pub name: &'static str,
    /// wire id
    pub id: i32,
    /// a failure in a critical filter closes the connection
    pub critical: bool,
}

/// One transform stage.
pub trait Filter: Send {
    /// static description of the filter type
    fn description(&self) -> &'static FilterDescription;

    /// drop any partial state, called before each message
    fn reset(&mut self) {}

    /// transform `bufs` and pass the result toward the wire
    fn write(&mut self, link: &mut Link<'_>, bufs: Vec<Buffer>) -> Result<(), Error>;

    /// `n` bytes previously passed toward the wire were accepted
    fn on_write_completed(&mut self, link: &mut Link<'_>, n: usize) -> Result<(), Error>;

    /// the application side wants up to `n` cleartext bytes
    fn read(&mut self, link: &mut Link<'_>, n: usize) -> Result<(), Error>;

    /// bytes arrived from the wire side, an empty buffer means no more input
    fn on_read_completed(&mut self, link: &mut Link<'_>, buf: Buffer) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hop {
    App,
    Stage(usize),
    Wire,
}

enum Event {
    Write(Vec<Buffer>),
    WriteCompleted(usize),
    Read(usize),
    ReadCompleted(Buffer),
}

/// A stage's view of its neighbours.
pub struct Link<'a> {
    pos: usize,
    count: usize,
    events: &'a mut VecDeque<(Hop, Event)>,
}

impl<'a> Link<'a> {
    fn toward_wire(&self) -> Hop {
        if self.pos + 1 < self.count {
            Hop::Stage(self.pos + 1)
        } else {
            Hop::Wire
        }
    }

    fn toward_app(&self) -> Hop {
        if self.pos == 0 {
            Hop::App
        } else {
            Hop::Stage(self.pos - 1)
        }
    }

    /// pass data toward the wire
    pub fn write(&mut self, bufs: Vec<Buffer>) {
        let hop = self.toward_wire();
        self.events.push_back((hop, Event::Write(bufs)));
    }

    /// ask the wire side for up to `n` bytes
    pub fn read(&mut self, n: usize) {
        let hop = self.toward_wire();
        self.events.push_back((hop, Event::Read(n)));
    }

    /// report `n` bytes of the application side's write as done
    pub fn write_completed(&mut self, n: usize) {
        let hop = self.toward_app();
        self.events.push_back((hop, Event::WriteCompleted(n)));
    }

    /// deliver bytes toward the application
    pub fn read_completed(&mut self, buf: Buffer) {
        let hop = self.toward_app();
        self.events.push_back((hop, Event::ReadCompleted(buf)));
    }
}

#[derive(Default)]
struct WireProxy {
    input: Buffer,
    output: Vec<Buffer>,
}

#[derive(Default)]
struct AppProxy {
    written: usize,
    read: Vec<Buffer>,
}

/// Ordered set of filter stages owned by one connection.
#[derive(Default)]
pub struct FilterChain {
    stages: Vec<Box<dyn Filter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.description().name))
            .finish()
    }
}

impl FilterChain {
    /// build a chain, application side first
    pub fn new(stages: Vec<Box<dyn Filter>>) -> Result<Self, Error> {
        if stages.len() > MAX_FILTERS {
            return Err(Error::FilterCount(stages.len(), MAX_FILTERS));
        }
        Ok(FilterChain { stages })
    }

    /// number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// true if the chain passes data through untouched
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// wire ids of the stages
    pub fn ids(&self) -> Vec<i32> {
        self.stages.iter().map(|s| s.description().id).collect()
    }

    /// true if the chain consists of exactly these filter ids
    pub fn matches(&self, ids: &[i32]) -> bool {
        self.stages.len() == ids.len()
            && self
                .stages
                .iter()
                .zip(ids)
                .all(|(s, id)| s.description().id == *id)
    }

    /// true if any stage is critical
    pub fn is_critical(&self) -> bool {
        self.stages.iter().any(|s| s.description().critical)
    }

    /// reset every stage
    pub fn reset(&mut self) {
        for s in self.stages.iter_mut() {
            s.reset();
        }
    }

    fn pump(
        &mut self,
        first: Event,
        wire: &mut WireProxy,
        app: &mut AppProxy,
    ) -> Result<(), Error> {
        let count = self.stages.len();
        let mut events = VecDeque::new();
        events.push_back((Hop::Stage(0), first));

        while let Some((hop, event)) = events.pop_front() {
            match hop {
                Hop::Stage(pos) => {
                    let stage = &mut self.stages[pos];
                    let mut link = Link {
                        pos,
                        count,
                        events: &mut events,
                    };
                    match event {
                        Event::Write(bufs) => stage.write(&mut link, bufs)?,
                        Event::WriteCompleted(n) => stage.on_write_completed(&mut link, n)?,
                        Event::Read(n) => stage.read(&mut link, n)?,
                        Event::ReadCompleted(b) => stage.on_read_completed(&mut link, b)?,
                    }
                }
                Hop::Wire => {
                    let last = Hop::Stage(count - 1);
                    match event {
                        Event::Write(bufs) => {
                            let n = buffer::total_len(&bufs);
                            wire.output.extend(bufs);
                            events.push_back((last, Event::WriteCompleted(n)));
                        }
                        Event::Read(n) => {
                            let n = n.min(wire.input.len());
                            let chunk = wire.input.slice(0, n);
                            wire.input = wire.input.slice_from(n);
                            events.push_back((last, Event::ReadCompleted(chunk)));
                        }
                        _ => return Err(misrouted()),
                    }
                }
                Hop::App => match event {
                    Event::WriteCompleted(n) => app.written += n,
                    Event::ReadCompleted(b) => app.read.push(b),
                    _ => return Err(misrouted()),
                },
            }
        }
        Ok(())
    }

    /// Filters an outgoing message. Writes are pushed through the chain until
    /// every byte has been reported as transferred.
    pub fn filter(&mut self, unfiltered: &[Buffer]) -> Result<Vec<Buffer>, Error> {
        if self.stages.is_empty() {
            return Ok(unfiltered.to_vec());
        }
        let total = buffer::total_len(unfiltered);
        let mut wire = WireProxy::default();
        let mut done = 0;
        while done < total {
            let mut app = AppProxy::default();
            let rest = buffer::skip_bytes(unfiltered, done);
            self.pump(Event::Write(rest), &mut wire, &mut app)?;
            if app.written == 0 {
                return Err(Error::filter(
                    ErrorCode::FILTER_MESSAGE,
                    "filter chain made no progress",
                ));
            }
            done += app.written;
        }
        if done != total {
            return Err(Error::filter(
                ErrorCode::FILTER_MESSAGE,
                format!("filtered {done} bytes of {total}"),
            ));
        }
        Ok(wire.output)
    }

    /// Unfilters an incoming message, reading until `expected` cleartext
    /// bytes have been produced.
    pub fn unfilter(&mut self, filtered: Buffer, expected: usize) -> Result<Buffer, Error> {
        if self.stages.is_empty() {
            return Ok(filtered);
        }
        let mut wire = WireProxy {
            input: filtered,
            output: Vec::new(),
        };
        let mut out = Vec::new();
        let mut done = 0;
        while done < expected {
            let mut app = AppProxy::default();
            self.pump(Event::Read(expected - done), &mut wire, &mut app)?;
            let got = buffer::total_len(&app.read);
            if got == 0 {
                return Err(Error::filter(
                    ErrorCode::UNFILTER_MESSAGE,
                    format!("filtered payload ended after {done} of {expected} bytes"),
                ));
            }
            done += got;
            out.extend(app.read);
        }
        if done != expected {
            return Err(Error::filter(
                ErrorCode::UNFILTER_MESSAGE,
                format!("unfiltered {done} bytes, expected {expected}"),
            ));
        }
        Ok(buffer::concat(&out))
    }
}

fn misrouted() -> Error {
    Error::filter(ErrorCode::FILTER, "filter event sent past the end of the chain")
}

/// Produces a fresh stage for a session.
pub type FilterFactory = Arc<dyn Fn() -> Result<Box<dyn Filter>, Error> + Send + Sync>;

/// Filters a server is willing to install, by wire id.
#[derive(Clone)]
pub struct FilterRegistry {
    factories: HashMap<i32, FilterFactory>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = FilterRegistry {
            factories: HashMap::new(),
        };
        registry.register(IDENTITY_FILTER_ID, || Ok(identity()));
        registry.register(ZLIB_FILTER_ID, || Ok(zlib()));
        registry
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().collect();
        ids.sort();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}

impl FilterRegistry {
    /// register a factory under `id`, replacing any previous one
    pub fn register<F>(&mut self, id: i32, factory: F)
    where
        F: Fn() -> Result<Box<dyn Filter>, Error> + Send + Sync + 'static,
    {
        self.factories.insert(id, Arc::new(factory));
    }

    /// true if every id has a factory
    pub fn supports(&self, ids: &[i32]) -> bool {
        ids.iter().all(|id| self.factories.contains_key(id))
    }

    /// build a chain from wire ids, application side first
    pub fn create_chain(&self, ids: &[i32]) -> Result<FilterChain, Error> {
        if ids.len() > MAX_FILTERS {
            return Err(Error::FilterCount(ids.len(), MAX_FILTERS));
        }
        let stages = ids
            .iter()
            .map(|id| match self.factories.get(id) {
                Some(f) => f(),
                None => Err(Error::UnknownFilter(*id)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        FilterChain::new(stages)
    }
}

/// a pass-through stage
pub fn identity() -> Box<dyn Filter> {
    Box::new(IdentityFilter)
}

/// a zlib compression stage
pub fn zlib() -> Box<dyn Filter> {
    Box::new(BlockFilter::new(ZlibCodec::default()))
}

/// an AES-256-GCM stage keyed with a pre-shared key
pub fn aes_gcm(key: &[u8; AES_GCM_KEY_LEN]) -> Result<Box<dyn Filter>, Error> {
    Ok(Box::new(BlockFilter::new(AesGcmCodec::new(key)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Vec<Buffer> {
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(50);
        vec![
            Buffer::from(b"header".to_vec()),
            Buffer::from(text),
            Buffer::from(b"tail".to_vec()),
        ]
    }

    fn round_trip(chain: &mut FilterChain, other: &mut FilterChain) -> Buffer {
        let msg = message();
        let filtered = chain.filter(&msg).unwrap();
        let wire = buffer::concat(&filtered);
        other.unfilter(wire, buffer::total_len(&msg)).unwrap()
    }

    #[test]
    fn identity_chain_is_transparent() {
        let mut a = FilterChain::new(vec![identity(), identity()]).unwrap();
        let mut b = FilterChain::new(vec![identity(), identity()]).unwrap();
        let msg = message();
        let filtered = a.filter(&msg).unwrap();
        assert_eq!(buffer::total_len(&filtered), buffer::total_len(&msg));
        let out = round_trip(&mut a, &mut b);
        assert_eq!(&out[..], &buffer::concat(&msg)[..]);
    }

    #[test]
    fn compression_and_encryption_stack() {
        let key = [7u8; AES_GCM_KEY_LEN];
        let mut a = FilterChain::new(vec![zlib(), aes_gcm(&key).unwrap(), identity()]).unwrap();
        let mut b = FilterChain::new(vec![zlib(), aes_gcm(&key).unwrap(), identity()]).unwrap();
        assert_eq!(a.ids(), vec![ZLIB_FILTER_ID, AES_GCM_FILTER_ID, IDENTITY_FILTER_ID]);
        assert!(a.is_critical());

        let msg = message();
        let filtered = buffer::concat(&a.filter(&msg).unwrap());
        assert!(filtered.len() < buffer::total_len(&msg));
        let out = b.unfilter(filtered, buffer::total_len(&msg)).unwrap();
        assert_eq!(&out[..], &buffer::concat(&msg)[..]);

        // the chain is reusable for the next message
        let out = round_trip(&mut a, &mut b);
        assert_eq!(&out[..], &buffer::concat(&message())[..]);
    }

    #[test]
    fn wrong_key_fails_to_unfilter() {
        let mut a = FilterChain::new(vec![aes_gcm(&[1; 32]).unwrap()]).unwrap();
        let mut b = FilterChain::new(vec![aes_gcm(&[2; 32]).unwrap()]).unwrap();
        let msg = message();
        let filtered = buffer::concat(&a.filter(&msg).unwrap());
        assert!(b.unfilter(filtered, buffer::total_len(&msg)).is_err());
    }

    #[test]
    fn truncated_input_fails_to_unfilter() {
        let mut a = FilterChain::new(vec![zlib()]).unwrap();
        let mut b = FilterChain::new(vec![zlib()]).unwrap();
        let msg = message();
        let filtered = buffer::concat(&a.filter(&msg).unwrap());
        let cut = filtered.slice(0, filtered.len() - 3);
        assert!(b.unfilter(cut, buffer::total_len(&msg)).is_err());
    }

    #[test]
    fn registry_builds_chains_by_id() {
        let registry = FilterRegistry::default();
        let chain = registry.create_chain(&[ZLIB_FILTER_ID, IDENTITY_FILTER_ID]).unwrap();
        assert!(chain.matches(&[ZLIB_FILTER_ID, IDENTITY_FILTER_ID]));
        assert!(!chain.matches(&[ZLIB_FILTER_ID]));
        assert!(!registry.supports(&[AES_GCM_FILTER_ID]));
        assert!(matches!(
            registry.create_chain(&[AES_GCM_FILTER_ID]),
            Err(Error::UnknownFilter(AES_GCM_FILTER_ID))
        ));
        let too_many = vec![IDENTITY_FILTER_ID; MAX_FILTERS + 1];
        assert!(matches!(
            registry.create_chain(&too_many),
            Err(Error::FilterCount(..))
        ));
    }
}
