//! Worker threads and the scheduling queue.
//!
//! # Responsibilities
//! - Accept tasks through `schedule`, or hand them back when saturated
//! - Run each task on exactly one OS worker thread
//! - Grow through the ThreadLauncher when demand exceeds idle capacity
//! - Retire idle workers above `min`
//!
//! # Scheduling policy
//! ```text
//! waiting < idle + starting           → enqueue (a worker is already on its way)
//! else launcher has room              → enqueue and launch one worker
//! else waiting < idle + starting + Q  → enqueue (bounded backlog)
//! else                                → reject, task returned to caller
//! ```
//! `Q` is `threads.queue_capacity`.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::ThreadConfig;
use crate::pool::launcher::{ThreadLauncher, ThreadLimits};

/// A unit of work for the pool.
pub trait Task: Send + 'static {
    /// Run to completion on the current worker.
    fn run(self);

    /// Dispose of a task that will never run (pool shut down).
    fn reject(self);
}

struct Shared<T> {
    name: String,
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    launcher: ThreadLauncher,
    queue_capacity: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    shutdown: AtomicBool,
}

/// Bounded, elastic pool of OS worker threads.
pub struct WorkerPool<T: Task> {
    shared: Arc<Shared<T>>,
}

impl<T: Task> WorkerPool<T> {
    pub fn new(config: &ThreadConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: config.name_prefix.clone(),
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                launcher: ThreadLauncher::new(ThreadLimits::from_config(config)),
                queue_capacity: AtomicUsize::new(config.queue_capacity),
                idle_timeout_ms: AtomicU64::new(config.idle_timeout_ms.max(1)),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Bootstrap the minimum number of workers.
    pub fn start(&self) -> usize {
        let shared = &self.shared;
        let started = shared
            .launcher
            .start_worker_thread(|id| spawn_worker(shared, id));
        tracing::info!(pool = %shared.name, started, "Worker pool started");
        started
    }

    /// Enqueue a task. Hands the task back when the pool is saturated or
    /// shutting down.
    pub fn schedule(&self, task: T) -> Result<(), T> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }

        let launch = {
            let mut queue = shared.queue.lock();
            // `shutdown` drains under this lock; a task pushed after that
            // would never be rejected.
            if shared.shutdown.load(Ordering::Acquire) {
                return Err(task);
            }
            let waiting = queue.len();
            let counts = shared.launcher.counts();
            let ready = counts.idle + counts.starting;

            let mut launch = false;
            if waiting >= ready {
                if shared.launcher.try_reserve_start(true) {
                    launch = true;
                } else if waiting >= ready + shared.queue_capacity.load(Ordering::Relaxed) {
                    return Err(task);
                }
            }
            queue.push_back(task);
            launch
        };
        shared.available.notify_one();

        if launch {
            // On failure the task stays queued for the next free worker.
            shared.launcher.spawn_reserved(|id| spawn_worker(shared, id));
        }
        Ok(())
    }

    pub fn launcher(&self) -> &ThreadLauncher {
        &self.shared.launcher
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Apply new bounds, backlog size and idle timeout.
    pub fn reconfigure(&self, config: &ThreadConfig) {
        let shared = &self.shared;
        shared.launcher.set_limits(ThreadLimits::from_config(config));
        shared
            .queue_capacity
            .store(config.queue_capacity, Ordering::Relaxed);
        shared
            .idle_timeout_ms
            .store(config.idle_timeout_ms.max(1), Ordering::Relaxed);
    }

    /// Stop accepting work, reject everything still queued and wake idle
    /// workers so they exit. Running tasks are not interrupted here.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<T> = shared.queue.lock().drain(..).collect();
        shared.available.notify_all();

        tracing::info!(pool = %shared.name, rejected = pending.len(), "Worker pool shutting down");
        for task in pending {
            task.reject();
        }
    }

    /// Wait until every worker has exited. Returns `false` on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.launcher.counts().total() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

fn spawn_worker<T: Task>(shared: &Arc<Shared<T>>, id: u64) -> io::Result<()> {
    let worker = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("{}-{}", shared.name, id))
        .spawn(move || worker_loop(worker, id))
        .map(|_| ())
}

fn worker_loop<T: Task>(shared: Arc<Shared<T>>, id: u64) {
    shared.launcher.on_child_thread_begin();
    tracing::debug!(pool = %shared.name, thread_id = id, "Worker started");

    let mut queue = shared.queue.lock();
    loop {
        if let Some(task) = queue.pop_front() {
            let busy = shared.launcher.on_child_thread_resume();
            MutexGuard::unlocked(&mut queue, || {
                run_task(&shared.name, id, task);
                drop(busy);
            });
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let idle_timeout = Duration::from_millis(shared.idle_timeout_ms.load(Ordering::Relaxed));
        let timed_out = shared.available.wait_for(&mut queue, idle_timeout).timed_out();
        if timed_out && queue.is_empty() && shared.launcher.try_retire() {
            tracing::debug!(pool = %shared.name, thread_id = id, "Idle worker retired");
            return;
        }
    }
    drop(queue);

    shared.launcher.on_child_thread_exit();
    tracing::debug!(pool = %shared.name, thread_id = id, "Worker stopped");
}

/// Last line of defence: tasks handle their own failures, but a panic that
/// escapes one must not take the worker down with it.
fn run_task<T: Task>(pool: &str, id: u64, task: T) {
    if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
        tracing::error!(pool = %pool, thread_id = id, "Task panicked; worker recovered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    type Job = Box<dyn FnOnce() + Send>;

    struct TestTask {
        job: Job,
        rejected: Option<mpsc::Sender<()>>,
    }

    impl TestTask {
        fn new(f: impl FnOnce() + Send + 'static) -> Self {
            Self {
                job: Box::new(f),
                rejected: None,
            }
        }
    }

    impl Task for TestTask {
        fn run(self) {
            (self.job)()
        }

        fn reject(self) {
            if let Some(tx) = self.rejected {
                let _ = tx.send(());
            }
        }
    }

    fn config(min: usize, max: usize, queue_capacity: usize) -> ThreadConfig {
        ThreadConfig {
            min,
            max,
            max_starting: 4,
            idle_timeout_ms: 50,
            queue_capacity,
            name_prefix: "test-worker".into(),
        }
    }

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn runs_scheduled_tasks() {
        let pool: WorkerPool<TestTask> = WorkerPool::new(&config(1, 4, 8));
        pool.start();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(pool.schedule(TestTask::new(move || tx.send(i).unwrap())).is_ok());
        }
        let mut seen: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_when_saturated_and_backlog_full() {
        let pool: WorkerPool<TestTask> = WorkerPool::new(&config(1, 1, 1));
        pool.start();
        assert!(wait_until(Duration::from_secs(5), || pool.launcher().counts().idle == 1));

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.schedule(TestTask::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .ok()
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // One slot of backlog, then rejection.
        assert!(pool.schedule(TestTask::new(|| {})).is_ok());
        assert!(pool.schedule(TestTask::new(|| {})).is_err());
        assert!(pool.launcher().counts().active <= 1);

        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.queued() == 0));
        assert!(pool.schedule(TestTask::new(|| {})).is_ok());

        pool.shutdown();
    }

    #[test]
    fn grows_under_load_without_exceeding_max() {
        let pool: WorkerPool<TestTask> = WorkerPool::new(&config(0, 3, 16));
        pool.start();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..6 {
            let rx = Arc::clone(&release_rx);
            pool.schedule(TestTask::new(move || {
                let _ = rx.lock().recv();
            }))
            .ok()
            .unwrap();
            assert!(pool.launcher().counts().total() <= 3);
        }

        assert!(wait_until(Duration::from_secs(5), || pool.launcher().counts().active == 3));
        assert!(pool.launcher().counts().total() <= 3);

        for _ in 0..6 {
            release_tx.send(()).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || pool.launcher().counts().active == 0));
        pool.shutdown();
    }

    #[test]
    fn idle_workers_retire_down_to_min() {
        let pool: WorkerPool<TestTask> = WorkerPool::new(&config(1, 4, 0));
        pool.start();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..3 {
            let rx = Arc::clone(&release_rx);
            let _ = pool.schedule(TestTask::new(move || {
                let _ = rx.lock().recv();
            }));
        }
        assert!(wait_until(Duration::from_secs(5), || pool.launcher().counts().total() >= 2));
        for _ in 0..3 {
            let _ = release_tx.send(());
        }

        assert!(wait_until(Duration::from_secs(5), || pool.launcher().counts().total() == 1));
        pool.shutdown();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool: WorkerPool<TestTask> = WorkerPool::new(&config(1, 1, 4));
        pool.start();

        pool.schedule(TestTask::new(|| panic!("boom"))).ok().unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule(TestTask::new(move || tx.send(()).unwrap()))
            .ok()
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let counts = pool.launcher().counts();
            counts.active == 0 && counts.idle == 1
        }));
        pool.shutdown();
    }

    #[test]
    fn shutdown_rejects_queued_tasks() {
        let pool: WorkerPool<TestTask> = WorkerPool::new(&config(1, 1, 4));
        pool.start();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.schedule(TestTask::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .ok()
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (rejected_tx, rejected_rx) = mpsc::channel();
        let mut queued = TestTask::new(|| panic!("must not run"));
        queued.rejected = Some(rejected_tx);
        pool.schedule(queued).ok().unwrap();

        pool.shutdown();
        rejected_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(pool.schedule(TestTask::new(|| {})).is_err());

        release_tx.send(()).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn schedule_racing_shutdown_never_strands_a_task() {
        for _ in 0..50 {
            let pool = Arc::new(WorkerPool::<TestTask>::new(&config(1, 2, 64)));
            pool.start();
            let ran = Arc::new(AtomicUsize::new(0));
            let (rejected_tx, rejected_rx) = mpsc::channel();

            let scheduler = {
                let pool = Arc::clone(&pool);
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    let mut refused = 0;
                    for _ in 0..100 {
                        let ran = Arc::clone(&ran);
                        let mut task = TestTask::new(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        });
                        task.rejected = Some(rejected_tx.clone());
                        if pool.schedule(task).is_err() {
                            refused += 1;
                        }
                    }
                    refused
                })
            };
            pool.shutdown();
            let refused = scheduler.join().unwrap();

            assert!(pool.await_termination(Duration::from_secs(5)));
            assert_eq!(pool.queued(), 0);
            let rejected = rejected_rx.try_iter().count();
            assert_eq!(ran.load(Ordering::SeqCst) + rejected + refused, 100);
        }
    }
}
