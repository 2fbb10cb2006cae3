use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use crossbeam::sync::WaitGroup;
use log::debug;

use super::selector::SourceRun;
use super::EngineShared;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool fed over a channel. Dropping the pool struct
/// detaches the workers; they stay alive for as long as a [`PoolHandle`]
/// keeps the feed open.
pub struct WorkerPool {
    tx: Sender<Job>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let stop = Arc::new(AtomicBool::new(false));
        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                let stop = stop.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            if stop.load(Ordering::Acquire) {
                                break;
                            }
                            job();
                        }
                    })
                    .expect("spawning a worker thread")
            })
            .collect();
        Self { tx, stop, workers }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            tx: self.tx.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Drain the queue and wait for the workers to finish.
    pub fn join(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    /// Abandon queued and running work; workers are left to die on their
    /// own once their current job returns.
    pub fn abandon(self) {
        self.stop.store(true, Ordering::Release);
        drop(self.tx);
    }
}

/// Cheap submission handle into a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    tx: Sender<Job>,
    stop: Arc<AtomicBool>,
}

impl PoolHandle {
    /// False when the pool is shutting down; the job is dropped in that
    /// case.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Box::new(job)).is_ok()
    }
}

impl EngineShared {
    /// The dispatch phase of one iteration: one selection loop per source
    /// on the dispatcher pool, then wait until the last in-flight move
    /// released its slots. Returns the bytes moved during this call.
    pub(crate) fn dispatch_block_moves(self: &Arc<Self>) -> u64 {
        let before = self.connector.bytes_moved();
        let sources = self.sources.lock().clone();
        debug!(
            "{}: dispatching {} source(s)",
            self.connector.name(),
            sources.len()
        );

        let wait_group = WaitGroup::new();
        for source in sources {
            let shared = Arc::clone(self);
            let wait_group = wait_group.clone();
            self.dispatcher.submit(move || {
                SourceRun::new(shared, source).dispatch_blocks();
                drop(wait_group);
            });
        }
        wait_group.wait();
        self.wait_for_move_completion();
        self.connector.bytes_moved() - before
    }

    /// Poll until no target node has pending moves. Movers broadcast on
    /// the progress condition whenever a slot is released, so the waits
    /// normally end early.
    fn wait_for_move_completion(&self) {
        loop {
            let busy = {
                let targets = self.targets.lock();
                targets.iter().any(|t| t.node().pending() > 0)
            };
            if !busy {
                return;
            }
            self.wait_progress(self.config.block_move_wait);
        }
    }
}
