//! The seam between fibers and threads.
//!
//! The interpreter never spawns threads itself; every slice of fiber work
//! is a [`Job`] handed to an [`Executor`]. The thread-pool executor gives
//! real parallelism; the test executor runs jobs only when told to, making
//! scheduling decisions explicit and tests deterministic.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One unit of work: a fiber's run loop until it suspends, yields, or ends.
pub type Job = Box<dyn FnOnce() + Send>;

/// Sink for fiber work.
pub trait Executor: Send + Sync + 'static {
    /// Enqueues a job for execution. Implementations must eventually run
    /// every submitted job while they are alive, in submission order or
    /// any interleaving of it.
    fn submit(&self, job: Job);
}

struct PoolShared {
    queue: SegQueue<Job>,
    sleep: Mutex<()>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size worker pool over a lock-free injector queue. Idle workers
/// park on a condvar; `submit` wakes one.
///
/// Dropping the pool stops the workers after their current job; jobs still
/// queued are abandoned, which surfaces to joiners as a lost fiber.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Starts a pool with `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: SegQueue::new(),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("fibra-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning a worker thread succeeds")
            })
            .collect();
        Self { shared, workers }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        if let Some(job) = shared.queue.pop() {
            job();
            continue;
        }
        let mut guard = shared.sleep.lock();
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        // Re-check under the lock so a submit between the failed pop and
        // this point cannot be missed.
        if shared.queue.is_empty() {
            shared.wake.wait(&mut guard);
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit(&self, job: Job) {
        self.shared.queue.push(job);
        let _guard = self.shared.sleep.lock();
        self.shared.wake.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleep.lock();
            self.shared.wake.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Deterministic executor for tests: jobs queue up until the test drives
/// them with [`run_next`](Self::run_next) or [`run_all`](Self::run_all),
/// on the calling thread.
#[derive(Default)]
pub struct TestExecutor {
    queue: SegQueue<Job>,
}

impl TestExecutor {
    /// Creates an empty test executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the oldest queued job, if any. Returns whether one ran.
    pub fn run_next(&self) -> bool {
        match self.queue.pop() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs (including ones they enqueue) until the queue is empty.
    /// Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Whether any work is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Executor for TestExecutor {
    fn submit(&self, job: Job) {
        self.queue.push(job);
    }
}
