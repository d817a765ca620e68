//! Executors — scheduling and worker orchestration.
//!
//! Both offered-load modes share one scheduling model: a single timer task
//! that dispatches work units at their wall-clock offsets, and a pool of
//! worker tasks that execute them. The separation is load-bearing. The
//! timer only ever does `queue.push(work)` — it never performs network I/O,
//! so a slow request can never delay the next wave launch or replay event.
//! Conflating the two pools is exactly the failure mode this design exists
//! to avoid.
//!
//! # High-level flow
//! 1. The executor spawns `workers` tasks over a shared [`WorkQueue`].
//! 2. A timer loop walks the schedule (`next_tick += step;
//!    sleep_until(next_tick)` for waves, cumulative scaled delays for
//!    replay) and pushes one work unit per dispatch, tagged with its wave
//!    number or event index.
//! 3. Workers pop units, run the journey or endpoint handler, append a
//!    completion record, and count down the [`CompletionLatch`].
//! 4. The executor awaits the latch with a timeout of the scheduled
//!    duration plus a safety margin. A timeout closes the run with a
//!    partial flag; whatever is still in flight is abandoned.
//!
//! # Queue mechanics
//! The queue is a deque guarded by a mutex plus a semaphore whose permits
//! mirror the queue length: `push` adds a permit, `pop` claims one and
//! takes the head. Workers therefore block on the semaphore, not on a
//! channel receiver, and any number of workers can drain the same queue.
//!
//! # Cancellation
//! A `watch` channel broadcasts shutdown. The timer and every worker
//! `select!` against it: dispatch stops immediately, in-flight requests
//! run to completion or time out on their own 30 s budget, and the latch
//! resolves with the partial flag set.
//!
//! # Worker crashes
//! A panic inside a journey is caught at the worker boundary
//! (`catch_unwind` around the work future) and emitted as a completion
//! record with a crash error, so the latch still counts down and one bad
//! worker cannot hang the terminal barrier.

pub mod replay;
pub mod streaming;
pub mod wave;

pub use replay::ReplayExecutor;
pub use streaming::StreamingReplayExecutor;
pub use wave::WaveExecutor;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;

/// Extra wait beyond the scheduled duration before the run is declared
/// stuck and abandoned. Covers in-flight requests at their worst.
pub const DRAIN_MARGIN: Duration = Duration::from_secs(120);

/// Multi-consumer FIFO of pending work units. Pushing never blocks; popping
/// waits until a unit (or shutdown) arrives.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    tokens: Semaphore,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue { items: Mutex::new(VecDeque::new()), tokens: Semaphore::new(0) }
    }

    pub fn push(&self, item: T) {
        self.items.lock().expect("queue poisoned").push_back(item);
        self.tokens.add_permits(1);
    }

    /// Next unit, or `None` once the queue is closed.
    pub async fn pop(&self) -> Option<T> {
        match self.tokens.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.items.lock().expect("queue poisoned").pop_front()
            }
            Err(_) => None,
        }
    }

    /// Wake every waiting worker with `None`. Pending units are dropped;
    /// only call this when the run is over.
    pub fn close(&self) {
        self.tokens.close();
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts dispatched work down to zero; the terminal barrier of every run.
pub struct CompletionLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionLatch {
    pub fn new(expected: usize) -> Self {
        CompletionLatch { remaining: AtomicUsize::new(expected), notify: Notify::new() }
    }

    pub fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the count to drain. `false` means the timeout hit first and
    /// the caller should treat the results as partial.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.drained()).await.is_ok()
    }
}

/// Everything a worker needs: the queue it drains and the shutdown signal
/// it races against.
pub struct DispatchContext<T> {
    pub queue: Arc<WorkQueue<T>>,
    pub latch: Arc<CompletionLatch>,
    pub shutdown: watch::Receiver<bool>,
}

impl<T> Clone for DispatchContext<T> {
    fn clone(&self) -> Self {
        DispatchContext {
            queue: Arc::clone(&self.queue),
            latch: Arc::clone(&self.latch),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> DispatchContext<T> {
    pub fn new(expected: usize) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            DispatchContext {
                queue: Arc::new(WorkQueue::new()),
                latch: Arc::new(CompletionLatch::new(expected)),
                shutdown: rx,
            },
            tx,
        )
    }
}

/// Spawn `workers` tasks that drain the queue until it closes or shutdown
/// fires. The handler owns per-unit bookkeeping (records, latch).
pub fn spawn_workers<T, F, Fut>(
    ctx: DispatchContext<T>,
    workers: usize,
    handler: F,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send,
{
    (0..workers)
        .map(|_| {
            let mut ctx = ctx.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        item = ctx.queue.pop() => match item {
                            Some(item) => handler(item).await,
                            None => break,
                        },
                        _ = ctx.shutdown.changed() => {
                            if *ctx.shutdown.borrow() {
                                break;
                            }
                        },
                    }
                }
            })
        })
        .collect()
}
