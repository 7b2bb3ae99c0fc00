use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use exists_verifier_core::{StoreError, VerificationOutcome};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// One unit of verification work, run on a pool thread.
pub type VerificationJob = Box<dyn FnOnce() -> Result<VerificationOutcome, StoreError> + Send>;

/// Invoked on the consuming side for every job that produced an outcome.
pub type VerifiedCallback = Arc<dyn Fn(&VerificationOutcome) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker pool needs at least one worker")]
    EmptyPool,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker pool is shut down")]
    Closed,
    #[error("verification job failed: {0}")]
    Job(#[from] StoreError),
    #[error("verification job panicked")]
    Panicked,
}

/// Completion counts drained by one [`TaskPool::clean_results`] call, plus
/// the jobs still outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pending: usize,
    pub successful: usize,
    pub errored: usize,
}

/// Asynchronous job dispatch with completions drained by the caller.
pub trait TaskPool {
    /// Queue `job` without waiting for it to run.
    ///
    /// # Errors
    /// Returns [`WorkerError::Closed`] when the pool no longer accepts work.
    fn apply_async(
        &self,
        job: VerificationJob,
        callback: Option<VerifiedCallback>,
    ) -> Result<(), WorkerError>;

    /// Drain finished jobs, running their callbacks on the calling thread.
    fn clean_results(&self) -> PoolStats;
}

struct Task {
    job: VerificationJob,
    callback: Option<VerifiedCallback>,
}

struct Completion {
    result: Result<VerificationOutcome, WorkerError>,
    callback: Option<VerifiedCallback>,
}

/// Fixed-size pool of OS threads sharing one job queue.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    completions: Mutex<Receiver<Completion>>,
    outstanding: AtomicUsize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// # Errors
    /// Returns [`WorkerError::EmptyPool`] for a zero size, or
    /// [`WorkerError::Spawn`] when a thread cannot be started.
    pub fn new(size: usize) -> Result<Self, WorkerError> {
        if size == 0 {
            return Err(WorkerError::EmptyPool);
        }

        let (sender, receiver) = mpsc::channel::<Task>();
        let (completion_tx, completion_rx) = mpsc::channel::<Completion>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let completion_tx = completion_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("exists-verifier-{index}"))
                .spawn(move || worker_loop(&receiver, &completion_tx))?;
            workers.push(handle);
        }
        debug!(size, "worker pool started");

        Ok(Self {
            sender: Some(sender),
            completions: Mutex::new(completion_rx),
            outstanding: AtomicUsize::new(0),
            workers,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>, completions: &Sender<Completion>) {
    loop {
        let next = receiver.lock().recv();
        let Ok(task) = next else {
            return;
        };
        let result = match panic::catch_unwind(AssertUnwindSafe(task.job)) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(WorkerError::Job(err)),
            Err(_) => Err(WorkerError::Panicked),
        };
        if completions.send(Completion { result, callback: task.callback }).is_err() {
            return;
        }
    }
}

impl TaskPool for WorkerPool {
    fn apply_async(
        &self,
        job: VerificationJob,
        callback: Option<VerifiedCallback>,
    ) -> Result<(), WorkerError> {
        let sender = self.sender.as_ref().ok_or(WorkerError::Closed)?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if sender.send(Task { job, callback }).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(WorkerError::Closed);
        }
        Ok(())
    }

    fn clean_results(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        let completions = self.completions.lock();
        loop {
            let completion = match completions.try_recv() {
                Ok(completion) => completion,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            match completion.result {
                Ok(outcome) => {
                    stats.successful += 1;
                    if let Some(callback) = completion.callback {
                        callback(&outcome);
                    }
                }
                Err(err) => {
                    stats.errored += 1;
                    warn!(error = %err, "verification job errored");
                }
            }
        }
        stats.pending = self.outstanding.load(Ordering::SeqCst);
        stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread exited by panic");
            }
        }
    }
}
