//! Bounded worker pool
//!
//! A fixed number of worker tasks pull jobs from a bounded admission queue
//! (`workers * QUEUE_FACTOR` slots). Submitting into a full queue waits for a
//! slot, so bursts of record calls queue up instead of fanning out.
//!
//! Every submission yields a [`TaskHandle`] that settles exactly once.
//!
//! ```text
//! submit() ──► [ bounded queue ] ──► worker 0..N ──► oneshot ──► TaskHandle
//!                                        │
//!                         abort token ───┤ (cancels queued + in-flight)
//!                         caller token ──┘ (cancels that task only)
//! ```
//!
//! Must be constructed inside a Tokio runtime.

use crate::error::{Error, Result};
use async_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Admission queue slots per worker
pub const QUEUE_FACTOR: usize = 5;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A queued unit of work; settles its completion flag when dropped, whether
/// it ran, was rejected by a closed queue, or was abandoned mid-submit
struct Job {
    id: u64,
    run: BoxedJob,
    shared: Arc<Shared>,
}

impl Drop for Job {
    fn drop(&mut self) {
        self.shared.settle(self.id);
    }
}

/// State shared between the pool handle and its workers
struct Shared {
    /// Fired by [`WorkerPool::abort`]
    abort: CancellationToken,
    /// Completion flags of every submitted, unsettled job
    outstanding: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    live_workers: AtomicUsize,
}

impl Shared {
    fn settle(&self, id: u64) {
        let done = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(done) = done {
            done.cancel();
        }
    }
}

/// Bounded-concurrency task executor
pub struct WorkerPool {
    tx: Sender<Job>,
    shared: Arc<Shared>,
    workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity())
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerPool {
    /// Start a pool with `workers` workers (at least one)
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = async_channel::bounded(workers * QUEUE_FACTOR);

        let shared = Arc::new(Shared {
            abort: CancellationToken::new(),
            outstanding: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            live_workers: AtomicUsize::new(workers),
        });

        for index in 0..workers {
            tokio::spawn(worker_loop(index, rx.clone(), Arc::clone(&shared)));
        }

        debug!(workers, queue = workers * QUEUE_FACTOR, "worker pool started");

        Self {
            tx,
            shared,
            workers,
        }
    }

    /// Submit a unit of work
    ///
    /// `task` receives a token that fires when either `ctx` or the pool's
    /// abort fires. Waits for a queue slot when the queue is full.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] after [`close`](Self::close) or
    /// [`abort`](Self::abort).
    pub async fn submit<T, F, Fut>(&self, ctx: &CancellationToken, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        let abort = self.shared.abort.clone();
        let token = ctx.child_token();

        let run: BoxedJob = Box::pin(async move {
            let result = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    token.cancel();
                    Err(Error::Cancelled)
                }
                _ = token.cancelled() => Err(Error::Cancelled),
                result = task(token.clone()) => result,
            };
            let _ = result_tx.send(result);
        });

        self.shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, CancellationToken::new());

        let job = Job {
            id,
            run,
            shared: Arc::clone(&self.shared),
        };
        if self.tx.send(job).await.is_err() {
            return Err(Error::PoolClosed);
        }

        trace!(task = id, "task queued");
        Ok(TaskHandle { rx: result_rx })
    }

    /// Wait until every task submitted before this call has settled
    ///
    /// Tasks submitted after the call begins are not waited for.
    pub async fn wait_idle(&self) {
        let pending: Vec<CancellationToken> = self
            .shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for done in pending {
            done.cancelled().await;
        }
    }

    /// Cancel queued and in-flight tasks and refuse further submissions
    pub fn abort(&self) {
        if !self.shared.abort.is_cancelled() {
            debug!(outstanding = self.outstanding(), "worker pool aborted");
        }
        self.shared.abort.cancel();
        self.tx.close();
    }

    /// Refuse further submissions; already queued work still runs
    ///
    /// Workers exit once the queue is drained.
    pub fn close(&self) {
        if self.tx.close() {
            debug!(outstanding = self.outstanding(), "worker pool closed");
        }
    }

    /// Whether the pool still admits work
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shared.abort.is_cancelled()
    }

    /// Configured concurrency limit
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Admission queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.workers * QUEUE_FACTOR
    }

    /// Number of submitted tasks that have not settled yet
    pub fn outstanding(&self) -> usize {
        self.shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of worker tasks still running
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

async fn worker_loop(index: usize, rx: Receiver<Job>, shared: Arc<Shared>) {
    trace!(worker = index, "worker started");

    while let Ok(mut job) = rx.recv().await {
        (&mut job.run).await;
    }

    shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    trace!(worker = index, "worker exited");
}

/// Handle to the eventual result of a submitted task
#[must_use = "a TaskHandle does nothing unless waited on"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's result
    ///
    /// Returns [`Error::Cancelled`] as soon as `ctx` fires, without waiting
    /// for the underlying task.
    pub async fn wait(self, ctx: &CancellationToken) -> Result<T> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            settled = self.rx => match settled {
                Ok(result) => result,
                Err(_) => Err(Error::TaskLost),
            },
        }
    }
}
