#![doc = include_str!("../README.md")]

mod task;

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lattice_store::Timestamp;
use parking_lot::{Condvar, Mutex};
pub use task::{block, Block, Chain, TaskStatus};
use task::{TaskKind, TaskRequest};
use tracing::{debug, info};

/// Duration of one simulation tick: 16,666,666 ns (60 Hz).
pub const TICK: Duration = Duration::from_nanos(16_666_666);

/// Delay before a `Split`/`Requeue` chain copy runs again: one tenth
/// of a tick.
pub const REDISPATCH_DELAY: Duration = Duration::from_nanos(1_666_666);

/// Maximum number of tasks executing simultaneously, across the whole
/// pool.
pub const MAX_CONCURRENT_TASKS: usize = 4;

/// Default number of worker threads.
pub const DEFAULT_WORKERS: usize = 5;

/// A simulation system bound to one scheduler worker.
///
/// `handle_events` is called once per tick and is the only step
/// allowed to write shared state; batch work prepared there runs in
/// `run_batch` right after. For one system, `handle_events(t)`
/// happens-before `run_batch(t)` happens-before
/// `handle_events(t + 1)`; across systems only store commit
/// timestamps order anything.
pub trait System: Send {
    /// Name used for the worker thread.
    fn name(&self) -> &'static str;

    /// Runs once on the worker thread before the first tick.
    fn thread_init(&mut self) {}

    /// Drains this tick's events and writes the store.
    fn handle_events(&mut self, tick: Timestamp);

    /// Batch work for this tick; must not write shared state.
    fn run_batch(&mut self) {}

    /// Saves state on shutdown. Called exactly once per system.
    fn terminate(&mut self) {}
}

/// Counting semaphore capping concurrent task execution.
struct Slots {
    free: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self {
            free: Mutex::new(count),
            freed: Condvar::new(),
        }
    }

    /// Blocks until a slot is free or the terminate flag is raised.
    /// Returns false on terminate.
    fn acquire(&self, terminate: &AtomicBool) -> bool {
        let mut free = self.free.lock();
        while *free == 0 {
            if terminate.load(Ordering::Relaxed) {
                return false;
            }
            self.freed.wait(&mut free);
        }
        *free -= 1;
        true
    }

    fn release(&self) {
        *self.free.lock() += 1;
        self.freed.notify_one();
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<TaskRequest>>,
    queue_changed: Condvar,
    slots: Slots,
    terminate: AtomicBool,
    seq: AtomicU64,
    epoch: Instant,
}

impl Shared {
    fn push(&self, due: Instant, kind: TaskKind) {
        let request = TaskRequest {
            due,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        self.queue.lock().push(request);
        self.queue_changed.notify_one();
    }
}

/// Handle for queueing work onto the shared worker pool. Cheap to
/// clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(BinaryHeap::new()),
                queue_changed: Condvar::new(),
                slots: Slots::new(MAX_CONCURRENT_TASKS),
                terminate: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// Queues a one-shot task, due immediately.
    pub fn queue(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.push(Instant::now(), TaskKind::Once(Box::new(f)));
    }

    /// Queues a chain, due immediately.
    pub fn queue_chain(&self, chain: Chain) {
        self.shared.push(Instant::now(), TaskKind::Chain(chain));
    }

    /// Queues a chain after a delay.
    pub fn queue_chain_after(&self, chain: Chain, delay: Duration) {
        self.shared
            .push(Instant::now() + delay, TaskKind::Chain(chain));
    }

    /// Runs a chain on the current thread, bypassing the queue.
    pub fn execute(&self, chain: Chain) {
        let shared = self.shared.clone();
        chain.run(move |fork| {
            shared.push(Instant::now() + REDISPATCH_DELAY, TaskKind::Chain(fork));
        });
    }

    /// Spawns the worker pool. The first `systems.len()` workers are
    /// each bound to one system; any remaining workers only serve the
    /// task queue. `workers` is raised to the number of systems if
    /// smaller.
    #[must_use]
    pub fn start(&self, systems: Vec<Box<dyn System>>, workers: usize) -> WorkerPool {
        let workers = workers.max(systems.len()).max(1);
        let mut systems = systems.into_iter();
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let system = systems.next();
            let name = system
                .as_ref()
                .map_or_else(|| format!("worker-{index}"), |s| s.name().to_owned());
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(&shared, system))
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        WorkerPool {
            handles,
            shared: self.shared.clone(),
        }
    }

    /// Raises the process-wide terminate flag and wakes every waiting
    /// worker. Idempotent.
    pub fn request_terminate(&self) {
        self.shared.terminate.store(true, Ordering::Relaxed);
        self.shared.queue_changed.notify_all();
        self.shared.slots.freed.notify_all();
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.shared.terminate.load(Ordering::Relaxed)
    }
}

/// The running worker threads. Dropping without
/// [`shutdown`](Self::shutdown) detaches them.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Raises the terminate flag and joins every worker.
    pub fn shutdown(self) {
        self.shared.terminate.store(true, Ordering::Relaxed);
        self.shared.queue_changed.notify_all();
        self.shared.slots.freed.notify_all();
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            if handle.join().is_err() {
                debug!(worker = %name, "worker panicked before shutdown");
            }
        }
        info!("scheduler drained");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

fn run_worker(shared: &Arc<Shared>, mut system: Option<Box<dyn System>>) {
    if let Some(system) = system.as_mut() {
        system.thread_init();
    }
    let mut next_tick = Instant::now() + TICK;

    loop {
        // Wait for a due task, running the bound system at every tick
        // boundary crossed meanwhile.
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.terminate.load(Ordering::Relaxed) {
                    drop(queue);
                    if let Some(system) = system.as_mut() {
                        debug!(system = system.name(), "terminate signal detected");
                        system.terminate();
                    }
                    shared.queue_changed.notify_all();
                    return;
                }

                let now = Instant::now();
                if now >= next_tick {
                    drop(queue);
                    let tick = timestamp_of(shared.epoch, next_tick);
                    if let Some(system) = system.as_mut() {
                        system.handle_events(tick);
                        system.run_batch();
                    }
                    next_tick += TICK;
                    queue = shared.queue.lock();
                    continue;
                }

                match queue.peek() {
                    Some(top) if top.due <= now => break,
                    top => {
                        let deadline = top.map_or(next_tick, |t| t.due.min(next_tick));
                        let _ = shared
                            .queue_changed
                            .wait_until(&mut queue, deadline);
                    }
                }
            }
            queue.pop().expect("peeked task vanished under the lock")
        };

        if !shared.slots.acquire(&shared.terminate) {
            continue;
        }
        match task.kind {
            TaskKind::Once(f) => f(),
            TaskKind::Chain(chain) => {
                chain.run(|fork| {
                    shared.push(Instant::now() + REDISPATCH_DELAY, TaskKind::Chain(fork));
                });
            }
        }
        shared.slots.release();
    }
}

fn timestamp_of(epoch: Instant, at: Instant) -> Timestamp {
    Timestamp::try_from(at.duration_since(epoch).as_nanos()).unwrap_or(Timestamp::MAX)
}
