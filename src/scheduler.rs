//! The M:N scheduler.
//!
//! A [`Scheduler`] owns a pool of worker threads and one shared FIFO task
//! queue. Each worker runs the loop in [`crate::worker`], claiming the first
//! task it is allowed to run and resuming it as a fiber. In caller-participates
//! mode the constructing thread is one of the workers: its share of the loop
//! runs inside a dedicated fiber that [`Scheduler::stop`] resumes.

use crate::PinningStrategy;
use crate::error::{Error, Result, fatal};
use crate::fiber::{DEFAULT_STACK_SIZE, Fiber, FiberConfig, State};
use crate::task::{Affinity, Task, Work};
use crate::thread::{Thread, Tid, current_tid};
use crate::worker;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Configuration for a scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Used to name worker threads `<name>_<index>`.
    pub name: String,
    /// Total number of workers, the caller included when `use_caller` is set.
    pub threads: usize,
    /// Whether the constructing thread participates as a worker.
    pub use_caller: bool,
    /// Stack size for the fibers the scheduler creates itself.
    pub stack_size: usize,
    /// How spawned workers are pinned to CPU cores.
    pub pinning: PinningStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "Scheduler".to_string(),
            threads: 1,
            use_caller: true,
            stack_size: DEFAULT_STACK_SIZE,
            pinning: PinningStrategy::None,
        }
    }
}

/// Hook fired when idle workers may have new work to look at.
///
/// Workers never block in the OS (the idle fiber spins), so the default
/// implementation does nothing. Implementations that park workers can use
/// it to unpark them.
pub trait Tickle: Send + Sync {
    fn tickle(&self);
}

#[derive(Debug, Default)]
pub struct NoopTickle;

impl Tickle for NoopTickle {
    fn tickle(&self) {
        tracing::trace!("tickle");
    }
}

struct Queue {
    tasks: VecDeque<Task>,
    thread_ids: Vec<Tid>,
}

/// State shared by the scheduler, its handles and every worker loop.
pub(crate) struct Shared {
    name: String,
    stack_size: usize,
    queue: Mutex<Queue>,
    active: CachePadded<AtomicUsize>,
    idle: CachePadded<AtomicUsize>,
    stopping: AtomicBool,
    stopped: AtomicBool,
    tickle: Arc<dyn Tickle>,
}

impl Shared {
    fn new(config: &SchedulerConfig, tickle: Arc<dyn Tickle>) -> Self {
        Shared {
            name: config.name.clone(),
            stack_size: config.stack_size,
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                thread_ids: Vec::with_capacity(config.threads),
            }),
            active: CachePadded::new(AtomicUsize::new(0)),
            idle: CachePadded::new(AtomicUsize::new(0)),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tickle,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Config for fibers the worker loop creates: idle and callback fibers.
    pub(crate) fn fiber_config(&self) -> FiberConfig {
        FiberConfig {
            stack_size: self.stack_size,
            runs_in_scheduler: true,
        }
    }

    fn submit(&self, task: Task) {
        if self.stopped.load(Ordering::Acquire) {
            fatal(Error::Misuse(format!(
                "scheduler `{}` has stopped and accepts no more tasks",
                self.name
            )));
        }
        if let Work::Fiber(fiber) = &task.work {
            if !fiber.runs_in_scheduler() {
                fatal(Error::Misuse(format!(
                    "fiber {} was not created to run in a scheduler",
                    fiber.id()
                )));
            }
            if fiber.state() == State::Dead {
                fatal(Error::InvalidState {
                    id: fiber.id(),
                    op: "be scheduled",
                    state: State::Dead,
                });
            }
        }

        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.tasks.is_empty();
            queue.tasks.push_back(task);
            was_empty
        };

        if need_tickle {
            self.tickle();
        }
    }

    /// Removes the first task a worker on `tid` may run.
    ///
    /// The flag asks the caller to tickle: either a task pinned elsewhere was
    /// skipped, or more tasks remain behind the claimed one.
    pub(crate) fn claim(&self, tid: Tid) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock();
        let mut tickle_me = false;
        let mut index = 0;

        while index < queue.tasks.len() {
            let task = &queue.tasks[index];
            if !task.affinity.admits(tid) {
                tickle_me = true;
                index += 1;
                continue;
            }
            if !task.claimable_by(tid) {
                index += 1;
                continue;
            }

            let task = queue.tasks.remove(index);
            // Counted before the lock drops so `stopping` never sees the
            // task neither queued nor active.
            self.active.fetch_add(1, Ordering::SeqCst);
            tickle_me |= index < queue.tasks.len();
            return (task, tickle_me);
        }

        (None, tickle_me)
    }

    pub(crate) fn finish_task(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn enter_idle(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_idle(&self) {
        self.idle.fetch_sub(1, Ordering::Relaxed);
    }

    /// Stop requested, nothing queued, nothing in flight.
    pub(crate) fn stopping(&self) -> bool {
        if !self.stopping.load(Ordering::Acquire) {
            return false;
        }
        let queue = self.queue.lock();
        queue.tasks.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn tickle(&self) {
        self.tickle.tickle();
    }
}

/// A cloneable handle for submitting work, usable from inside running tasks.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(Work::callback(f), Affinity::Any));
    }

    pub fn schedule_on<F>(&self, tid: Tid, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(Work::callback(f), Affinity::Thread(tid)));
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Task::new(Work::Fiber(fiber), Affinity::Any));
    }

    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, tid: Tid) {
        self.submit(Task::new(Work::Fiber(fiber), Affinity::Thread(tid)));
    }

    pub fn submit(&self, task: Task) {
        self.shared.submit(task);
    }
}

/// Cooperative M:N scheduler.
///
/// # Example
///
/// ```no_run
/// use fibersched::Scheduler;
///
/// let scheduler = Scheduler::new(4, false).unwrap();
/// scheduler.start().unwrap();
/// scheduler.schedule(|| println!("Hello from a fiber!"));
/// scheduler.stop().unwrap();
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    threads: Mutex<Vec<Thread>>,
    /// Runs the caller's share of the worker loop in caller-participates mode.
    root_fiber: Option<Arc<Fiber>>,
    root_thread: Option<Tid>,
    spawn_count: usize,
    started: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// With `use_caller` the calling thread counts as one of them.
    pub fn new(threads: usize, use_caller: bool) -> Result<Self> {
        Self::with_config(SchedulerConfig {
            threads,
            use_caller,
            ..SchedulerConfig::default()
        })
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        Self::with_tickle(config, Arc::new(NoopTickle))
    }

    pub fn with_tickle(config: SchedulerConfig, tickle: Arc<dyn Tickle>) -> Result<Self> {
        if config.threads == 0 {
            fatal(Error::Misuse(
                "a scheduler needs at least one thread".to_string(),
            ));
        }

        let shared = Arc::new(Shared::new(&config, tickle));

        let (root_fiber, root_thread, spawn_count) = if config.use_caller {
            let tid = current_tid();
            Thread::set_current_name(&config.name);
            shared.queue.lock().thread_ids.push(tid);

            let loop_shared = shared.clone();
            let root = Fiber::with_config(
                move || worker::run(loop_shared),
                FiberConfig {
                    stack_size: config.stack_size,
                    runs_in_scheduler: false,
                },
            )?;
            (Some(root), Some(tid), config.threads - 1)
        } else {
            (None, None, config.threads)
        };

        tracing::debug!(
            name = %config.name,
            threads = config.threads,
            use_caller = config.use_caller,
            "scheduler created"
        );

        Ok(Scheduler {
            shared,
            config,
            threads: Mutex::new(Vec::with_capacity(spawn_count)),
            root_fiber,
            root_thread,
            spawn_count,
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(Work::callback(f), Affinity::Any));
    }

    pub fn schedule_on<F>(&self, tid: Tid, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(Work::callback(f), Affinity::Thread(tid)));
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Task::new(Work::Fiber(fiber), Affinity::Any));
    }

    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, tid: Tid) {
        self.submit(Task::new(Work::Fiber(fiber), Affinity::Thread(tid)));
    }

    /// Queues a task.
    ///
    /// # Aborts
    ///
    /// If the scheduler has fully stopped, or the task carries a dead fiber
    /// or one not created to run in a scheduler.
    pub fn submit(&self, task: Task) {
        self.shared.submit(task);
    }

    /// Spawns the worker threads. Only the first call does anything.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if self.shared.stopping.load(Ordering::Acquire) {
            tracing::debug!(name = %self.name(), "start ignored: scheduler is stopping");
            return Ok(());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let core_ids = match self.config.pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_default(),
        };

        for index in 0..self.spawn_count {
            let shared = self.shared.clone();
            let core = self.config.pinning.core_for(index, &core_ids);
            let thread = Thread::spawn(format!("{}_{}", self.name(), index), move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        tracing::warn!(core = core.id, "failed to pin worker");
                    }
                }
                worker::run(shared);
            })?;

            self.shared.queue.lock().thread_ids.push(thread.id());
            threads.push(thread);
        }

        tracing::debug!(name = %self.name(), spawned = self.spawn_count, "scheduler started");
        Ok(())
    }

    /// Stops the scheduler once all queued and in-flight work has finished.
    ///
    /// In caller-participates mode the calling thread drains its share of
    /// the queue before the spawned workers are joined. Later calls are
    /// no-ops.
    ///
    /// # Aborts
    ///
    /// With `use_caller`, if called from any thread but the constructing
    /// one; otherwise, if called from one of the scheduler's workers. The
    /// caller is checked before the already-stopping test, so a repeated
    /// `stop()` from a disallowed thread aborts too.
    pub fn stop(&self) -> Result<()> {
        self.check_stop_caller();

        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            tracing::debug!(name = %self.name(), "stop ignored: already stopping");
            return Ok(());
        }
        tracing::debug!(name = %self.name(), "stopping scheduler");

        for _ in 0..self.spawn_count {
            self.shared.tickle();
        }

        if let Some(root) = &self.root_fiber {
            self.shared.tickle();
            root.resume();
            tracing::debug!(name = %self.name(), "caller worker loop finished");
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        let mut failed = 0;
        for thread in threads {
            let name = thread.name().to_string();
            if thread.join().is_err() {
                failed += 1;
                tracing::error!(thread = %name, "worker thread panicked");
            }
        }

        self.shared.stopped.store(true, Ordering::Release);

        if failed > 0 {
            Err(Error::WorkerPanicked { count: failed })
        } else {
            Ok(())
        }
    }

    fn may_stop_here(&self) -> bool {
        let tid = current_tid();
        match self.root_thread {
            Some(root) => root == tid,
            None => !self.shared.queue.lock().thread_ids.contains(&tid),
        }
    }

    fn check_stop_caller(&self) {
        if self.may_stop_here() {
            return;
        }
        let reason = if self.root_thread.is_some() {
            "only the thread that created it may stop a caller-participating scheduler"
        } else {
            "a scheduler cannot be stopped from one of its own workers"
        };
        fatal(Error::Misuse(format!("scheduler `{}`: {reason}", self.name())));
    }

    /// OS thread ids of every worker, the caller included in
    /// caller-participates mode.
    pub fn worker_ids(&self) -> Vec<Tid> {
        self.shared.queue.lock().thread_ids.clone()
    }

    /// Number of spawned OS threads, excluding the caller.
    pub fn spawned_threads(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.load(Ordering::Relaxed)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_stopping() {
            return;
        }
        if !self.may_stop_here() {
            tracing::error!(name = %self.name(), "scheduler dropped on a thread that cannot stop it");
            return;
        }
        tracing::warn!(name = %self.name(), "scheduler dropped without stop()");
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "stop during drop failed");
        }
    }
}
