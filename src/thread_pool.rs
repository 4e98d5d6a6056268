//! Worker threads that run dispatch jobs handed over by connection coroutines.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use may::sync::Mutex;
use serde::{Deserialize, Serialize};

/// How many worker threads a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadingModel {
    /// exactly `n` threads
    Fixed(usize),
    /// start with `min` threads, grow up to `max` while every thread is busy,
    /// idle threads above `min` retire
    Dynamic {
        /// threads kept alive
        min: usize,
        /// upper bound
        max: usize,
    },
}

impl Default for ThreadingModel {
    fn default() -> Self {
        ThreadingModel::Dynamic { min: 2, max: 32 }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    pending: AtomicUsize,
    idle: AtomicUsize,
    threads: AtomicUsize,
    min: usize,
    max: usize,
    idle_timeout: Duration,
}

/// Fixed or dynamically grown set of worker threads.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    jobs: Receiver<Job>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    /// spawn the initial threads
    pub fn new(name: &str, model: ThreadingModel, idle_timeout: Duration) -> io::Result<Self> {
        let (min, max) = match model {
            ThreadingModel::Fixed(n) => (n.max(1), n.max(1)),
            ThreadingModel::Dynamic { min, max } => (min.max(1), max.max(min.max(1))),
        };
        let (sender, jobs) = channel::unbounded();
        let pool = WorkerPool {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            jobs,
            shared: Arc::new(Shared {
                pending: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                threads: AtomicUsize::new(0),
                min,
                max,
                idle_timeout,
            }),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        };
        for _ in 0..min {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    fn spawn_worker(&self) -> io::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();
        let jobs = self.jobs.clone();
        shared.threads.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-{id}", self.name))
            .spawn(move || worker_loop(shared, jobs));
        match spawned {
            Ok(h) => {
                let mut handles = self.handles.lock().unwrap();
                handles.retain(|h| !h.is_finished());
                handles.push(h);
                Ok(())
            }
            Err(e) => {
                self.shared.threads.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// queue a job, growing the pool if no thread is free
    pub fn execute<F>(&self, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap();
        let sender = sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker pool is shut down"))?;

        let pending = self.shared.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > self.shared.idle.load(Ordering::SeqCst)
            && self.shared.threads.load(Ordering::SeqCst) < self.shared.max
        {
            if let Err(e) = self.spawn_worker() {
                warn!("failed to grow worker pool {}: {e}", self.name);
            }
        }

        sender.send(Box::new(job)).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            io::Error::new(io::ErrorKind::BrokenPipe, "worker pool is shut down")
        })
    }

    /// number of live threads
    pub fn threads(&self) -> usize {
        self.shared.threads.load(Ordering::SeqCst)
    }

    /// Stops accepting jobs, lets the workers drain the queue and joins them.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for h in handles {
            if h.join().is_err() {
                error!("worker of pool {} panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, jobs: Receiver<Job>) {
    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let job = jobs.recv_timeout(shared.idle_timeout);
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match job {
            Ok(job) => {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("worker job panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let retired = shared
                    .threads
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n > shared.min).then(|| n - 1)
                    })
                    .is_ok();
                if retired {
                    debug!("idle worker retired");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.threads.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Barrier};

    #[test]
    fn shutdown_drains_queued_jobs() {
        let pool = WorkerPool::new("test", ThreadingModel::Fixed(2), Duration::from_secs(5)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = count.clone();
            pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 50);
        assert!(pool.execute(|| {}).is_err());
    }

    #[test]
    fn dynamic_pool_grows_while_busy() {
        let model = ThreadingModel::Dynamic { min: 1, max: 4 };
        let pool = WorkerPool::new("grow", model, Duration::from_secs(5)).unwrap();
        assert_eq!(pool.threads(), 1);
        // only passable if four jobs run at the same time
        let barrier = Arc::new(Barrier::new(5));
        for _ in 0..4 {
            let barrier = barrier.clone();
            pool.execute(move || {
                barrier.wait();
            })
            .unwrap();
        }
        barrier.wait();
        assert_eq!(pool.threads(), 4);
    }

    #[test]
    fn panicking_job_keeps_the_worker() {
        let pool = WorkerPool::new("panic", ThreadingModel::Fixed(1), Duration::from_secs(5)).unwrap();
        pool.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
