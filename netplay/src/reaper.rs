//! Joins finished connect workers off the caller's thread.
//!
//! Every connect attempt runs on its own thread. Its `JoinHandle` goes onto a
//! queue drained by a single reaper thread, so `connect()` never waits and no
//! worker is left unjoined. A `None` on the queue stops the reaper after it has
//! joined everything queued before it.

use crate::error::NetError;
use log::{debug, warn};
use parking_lot::Mutex;
use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

thread_local! {
    static ON_WORKER: Cell<bool> = Cell::new(false);
}

type ReapQueue = mpsc::UnboundedSender<Option<JoinHandle<()>>>;

pub(crate) struct Reaper {
    // None once stopped; held while spawning so no handle can follow the sentinel
    running: Mutex<Option<(ReapQueue, JoinHandle<()>)>>,
    spawned: AtomicUsize,
    reaped: Arc<AtomicUsize>,
}

impl Reaper {
    pub fn start() -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<JoinHandle<()>>>();
        let reaped = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&reaped);
        let thread = thread::Builder::new()
            .name("connect-reaper".to_string())
            .spawn(move || {
                while let Some(Some(worker)) = rx.blocking_recv() {
                    join_worker(worker);
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                debug!("Reaper stopped");
            })?;

        Ok(Self {
            running: Mutex::new(Some((tx, thread))),
            spawned: AtomicUsize::new(0),
            reaped,
        })
    }

    /// Runs `work` on a new named thread and queues it for joining.
    pub fn spawn<F>(&self, name: String, work: F) -> Result<(), NetError>
    where
        F: FnOnce() + Send + 'static,
    {
        let running = self.running.lock();
        let (queue, _) = running.as_ref().ok_or(NetError::ShutDown)?;

        let worker = thread::Builder::new().name(name).spawn(move || {
            ON_WORKER.with(|flag| flag.set(true));
            work();
        })?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(orphan)) = queue.send(Some(worker)) {
            // reaper thread is gone; join here rather than leak the worker
            warn!("Reaper unavailable, joining connect worker inline");
            if let Some(worker) = orphan {
                join_worker(worker);
                self.reaped.fetch_add(1, Ordering::SeqCst);
            }
        }

        Ok(())
    }

    /// Stops the reaper and waits until every queued worker has been joined.
    pub fn shutdown(&self) {
        let stopped = self.running.lock().take();
        if let Some((queue, thread)) = stopped {
            let _ = queue.send(None);
            if thread.join().is_err() {
                warn!("Reaper thread panicked");
            }
        }
    }

    /// Stops accepting work and lets the reaper finish on its own.
    pub fn detach(&self) {
        if let Some((queue, _)) = self.running.lock().take() {
            let _ = queue.send(None);
        }
    }

    /// Shuts down, unless called from a connect worker, which the reaper may
    /// be joining at this very moment; there it only detaches.
    pub fn stop(&self) {
        if ON_WORKER.with(Cell::get) {
            self.detach();
        } else {
            self.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn reaped(&self) -> usize {
        self.reaped.load(Ordering::SeqCst)
    }
}

/// Joins one worker, logging a panic. Returns whether it exited cleanly.
fn join_worker(worker: JoinHandle<()>) -> bool {
    let name = worker.thread().name().unwrap_or("connect").to_string();
    let clean = worker.join().is_ok();
    if clean {
        debug!("Reaped {}", name);
    } else {
        warn!("Worker {} panicked", name);
    }
    clean
}
