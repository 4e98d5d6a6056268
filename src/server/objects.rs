use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use may::sync::{Condvar, Mutex};

use super::session::RequestContext;
use super::stub::{Call, Servant, StubEntry};
use crate::errors::{Error, ErrorCode, RemoteException};
use crate::net::frame::RspBuf;
use crate::token::{Token, TokenPool};

#[derive(Debug, Default)]
struct SweepState {
    kicked: bool,
    stopped: bool,
}

/// Wakes the sweeper early or stops it.
#[derive(Default)]
struct SweepSignal {
    state: Mutex<SweepState>,
    cond: Condvar,
}

impl SweepSignal {
    fn kick(&self) {
        self.state.lock().unwrap().kicked = true;
        self.cond.notify_one();
    }

    fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.cond.notify_all();
    }

    /// wait for the next round, false once stopped
    fn wait(&self, interval: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.kicked && !state.stopped {
            state = self.cond.wait_timeout(state, interval).unwrap().0;
        }
        state.kicked = false;
        !state.stopped
    }
}

/// Leased objects, one pre-allocated slot per token.
pub(crate) struct ObjectTable {
    tokens: TokenPool,
    slots: Vec<Mutex<Option<Arc<StubEntry>>>>,
    timeout: Duration,
    threshold: f32,
    signal: Arc<SweepSignal>,
}

impl ObjectTable {
    pub(crate) fn new(capacity: usize, timeout: Duration, threshold: f32) -> Self {
        ObjectTable {
            tokens: TokenPool::new(capacity),
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            timeout,
            threshold,
            signal: Arc::new(SweepSignal::default()),
        }
    }

    fn slot(&self, token: Token) -> Option<&Mutex<Option<Arc<StubEntry>>>> {
        if token.id() < 1 {
            return None;
        }
        self.slots.get(token.id() as usize - 1)
    }

    /// lease a token for `servant`
    pub(crate) fn insert(
        &self,
        servant: Arc<dyn Servant>,
    ) -> Result<(Token, Arc<StubEntry>), Error> {
        if self.tokens.utilization() > self.threshold {
            self.signal.kick();
        }
        let token = self.tokens.request()?;
        let entry = StubEntry::new(servant);
        match self.slot(token) {
            Some(slot) => *slot.lock().unwrap() = Some(entry.clone()),
            None => return Err(Error::TokenRequestFailed),
        }
        debug!("leased object {token}");
        Ok((token, entry))
    }

    /// the object leased under `token`
    pub(crate) fn lookup(&self, token: Token) -> Option<Arc<StubEntry>> {
        self.slot(token)?.lock().unwrap().clone()
    }

    /// clear the slot and give the token back, false if it was empty
    pub(crate) fn remove(&self, token: Token) -> bool {
        let Some(slot) = self.slot(token) else {
            return false;
        };
        let removed = slot.lock().unwrap().take().is_some();
        if removed {
            self.tokens.give_back(token);
            debug!("released object {token}");
        }
        removed
    }

    /// number of leased objects
    pub(crate) fn len(&self) -> usize {
        self.tokens.capacity() - self.tokens.available()
    }

    /// Reclaims every object that nobody else references and that has been
    /// idle longer than the object timeout.
    pub(crate) fn sweep(&self) -> usize {
        let mut reclaimed = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock().unwrap();
            let expired = match slot.as_ref() {
                Some(entry) => Arc::strong_count(entry) == 1 && entry.idle_for() > self.timeout,
                None => false,
            };
            if expired {
                *slot = None;
                drop(slot);
                self.tokens.give_back(Token::new(i as i32 + 1));
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!("idle sweep reclaimed {reclaimed} objects");
        }
        reclaimed
    }
}

/// Background thread running [`ObjectTable::sweep`] every interval, or
/// earlier when the table kicks it.
pub(crate) struct Sweeper {
    signal: Arc<SweepSignal>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn spawn(table: Arc<ObjectTable>, interval: Duration) -> io::Result<Self> {
        let signal = table.signal.clone();
        let handle = thread::Builder::new()
            .name("wirecall-sweeper".to_owned())
            .spawn(move || {
                while table.signal.wait(interval) {
                    table.sweep();
                }
                debug!("sweeper stopped");
            })?;
        Ok(Sweeper {
            signal,
            handle: Some(handle),
        })
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.signal.stop();
        if let Some(h) = self.handle.take() {
            h.join().ok();
        }
    }
}

fn code(code: ErrorCode) -> i32 {
    code.0
}

/// Control servant creating and deleting objects through registered
/// factories.
///
/// Functions:
/// 0. `create_object(name) -> (code, token)`
/// 1. `delete_object(token) -> code`
/// 2. `create_session_object(name) -> code`
/// 3. `delete_session_object() -> code`
pub(crate) struct FactoryServant;

impl Servant for FactoryServant {
    fn invoke(
        &self,
        ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException> {
        let core = ctx.core;
        match call.fn_id {
            0 => {
                let (name,): (String,) = call.decode_args()?;
                let ret = match core.make_servant(&name) {
                    None => (code(ErrorCode::OBJECT_FACTORY_NOT_FOUND), 0),
                    Some(servant) => match core.objects.insert(servant) {
                        Ok((token, entry)) => {
                            ctx.session.cached_stub = Some(entry);
                            (code(ErrorCode::OK), token.id())
                        }
                        Err(e) => {
                            warn!("create_object {name}: {e}");
                            (e.code().0, 0)
                        }
                    },
                };
                call.encode_result(rsp, &ret)
            }
            1 => {
                let (token,): (i32,) = call.decode_args()?;
                let ret = if core.objects.remove(Token::new(token)) {
                    ErrorCode::OK
                } else {
                    ErrorCode::DYNAMIC_OBJECT_NOT_FOUND
                };
                call.encode_result(rsp, &code(ret))
            }
            2 => {
                let (name,): (String,) = call.decode_args()?;
                let ret = match core.make_servant(&name) {
                    None => ErrorCode::OBJECT_FACTORY_NOT_FOUND,
                    Some(servant) => {
                        ctx.session.default_stub = Some(StubEntry::new(servant));
                        ErrorCode::OK
                    }
                };
                call.encode_result(rsp, &code(ret))
            }
            3 => {
                let ret = match ctx.session.default_stub.take() {
                    Some(_) => ErrorCode::OK,
                    None => ErrorCode::DYNAMIC_OBJECT_NOT_FOUND,
                };
                call.encode_result(rsp, &code(ret))
            }
            _ => Err(call.unknown_fn()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Servant for Nop {
        fn invoke(
            &self,
            _ctx: &mut RequestContext<'_>,
            call: &Call<'_>,
            _rsp: &mut RspBuf,
        ) -> Result<(), RemoteException> {
            Err(call.unknown_fn())
        }
    }

    #[test]
    fn exhausted_table_refuses_objects() {
        let table = ObjectTable::new(2, Duration::from_secs(60), 1.0);
        let (a, _) = table.insert(Arc::new(Nop)).unwrap();
        let (b, _) = table.insert(Arc::new(Nop)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            table.insert(Arc::new(Nop)),
            Err(Error::TokenRequestFailed)
        ));
        assert!(table.remove(a));
        assert!(!table.remove(a));
        assert!(table.insert(Arc::new(Nop)).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn lookup_of_unknown_tokens() {
        let table = ObjectTable::new(2, Duration::from_secs(60), 1.0);
        assert!(table.lookup(Token::none()).is_none());
        assert!(table.lookup(Token::new(1)).is_none());
        assert!(table.lookup(Token::new(99)).is_none());
    }

    #[test]
    fn sweep_spares_referenced_objects() {
        let table = ObjectTable::new(4, Duration::ZERO, 1.0);
        let (held, entry) = table.insert(Arc::new(Nop)).unwrap();
        let (dropped, _) = table.insert(Arc::new(Nop)).unwrap();
        thread::sleep(Duration::from_millis(5));

        assert_eq!(table.sweep(), 1);
        assert!(table.lookup(held).is_some());
        assert!(table.lookup(dropped).is_none());

        drop(entry);
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn sweep_spares_recently_used_objects() {
        let table = ObjectTable::new(4, Duration::from_secs(60), 1.0);
        table.insert(Arc::new(Nop)).unwrap();
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn kicked_sweeper_runs_before_the_interval() {
        let table = Arc::new(ObjectTable::new(2, Duration::ZERO, 0.0));
        let sweeper = Sweeper::spawn(table.clone(), Duration::from_secs(3600)).unwrap();
        let (first, _) = table.insert(Arc::new(Nop)).unwrap();
        thread::sleep(Duration::from_millis(5));
        // utilization is above the zero threshold, this kicks the sweeper
        table.insert(Arc::new(Nop)).unwrap();

        let mut reclaimed = false;
        for _ in 0..200 {
            reclaimed = table.lookup(first).is_none();
            if reclaimed {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(reclaimed);
        drop(sweeper);
    }
}
