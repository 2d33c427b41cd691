//! Stackful fibers.
//!
//! A [`Fiber`] owns a `corosensei` coroutine and the stack it runs on. The
//! body of every coroutine is a trampoline that loops forever: it takes the
//! fiber's pending callback, runs it, and suspends with `Finished`. That is
//! what lets [`Fiber::reset`] hand a dead fiber a new callback without
//! touching its stack.
//!
//! Every OS thread also gets a root fiber, created on first use, that stands
//! for the thread's native stack. It has no coroutine and can never be
//! resumed or yielded.
//!
//! State transitions are published by the resumer, after the context switch
//! back has completed. A fiber that reschedules itself and then yields is
//! therefore still `Running` until its stack is really free, and no other
//! worker can pick it up early.

use crate::error::{Error, Result, fatal};
use corosensei::stack::{DefaultStack, Stack};
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};

/// Stack size used when a config asks for `0`.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// A fiber body.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    Ready = 0,
    Running = 1,
    Dead = 2,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Dead,
        }
    }
}

/// Why a fiber handed control back to its resumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Suspend {
    /// Mid-callback cooperative yield.
    Yielded,
    /// The callback returned; the trampoline waits for the next one.
    Finished,
}

/// Construction parameters for a fiber.
#[derive(Clone, Debug)]
pub struct FiberConfig {
    /// Stack size in bytes. `0` selects [`DEFAULT_STACK_SIZE`].
    pub stack_size: usize,
    /// Whether the fiber is resumed by a scheduler loop rather than by the
    /// thread's root fiber.
    pub runs_in_scheduler: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            runs_in_scheduler: true,
        }
    }
}

/// Shared between a fiber and the trampoline running on its stack.
/// Never owns the coroutine, so the trampoline holding it forms no cycle.
struct Slot {
    body: Mutex<Option<Callback>>,
    yielder: AtomicPtr<Yielder<(), Suspend>>,
}

type FiberCoroutine = Coroutine<(), Suspend, Infallible, DefaultStack>;

struct Context {
    coroutine: UnsafeCell<FiberCoroutine>,
    slot: Arc<Slot>,
    stack_size: usize,
    stack_base: usize,
}

/// A stackful, cooperatively scheduled execution context.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    runs_in_scheduler: bool,
    /// `None` for a thread's root fiber.
    context: Option<Context>,
}

// SAFETY: the coroutine is only touched by the thread that won the
// Ready -> Running exchange in `resume` (until it publishes the next state) or
// through `&mut self` in `drop`. Everything else is atomic or locked.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

struct ThreadFibers {
    root: Arc<Fiber>,
    current: RefCell<Arc<Fiber>>,
    /// The fiber running this thread's scheduler loop, if any.
    scheduler: RefCell<Option<Arc<Fiber>>>,
}

impl ThreadFibers {
    fn new() -> Self {
        let root = Arc::new(Fiber::root());
        tracing::trace!(id = root.id, "root fiber created");
        ThreadFibers {
            current: RefCell::new(root.clone()),
            scheduler: RefCell::new(None),
            root,
        }
    }
}

thread_local! {
    static THREAD_FIBERS: ThreadFibers = ThreadFibers::new();
}

fn trampoline(slot: Arc<Slot>) -> impl FnOnce(&Yielder<(), Suspend>, ()) -> Infallible + 'static {
    move |yielder: &Yielder<(), Suspend>, _input: ()| -> Infallible {
        slot.yielder.store(
            yielder as *const Yielder<(), Suspend> as *mut _,
            Ordering::Release,
        );

        loop {
            // Taking the body moves it onto this frame; it is consumed by the
            // call, so everything it captured is dropped before we suspend.
            let body = slot.body.lock().take();
            if let Some(body) = body {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
                    tracing::error!(panic = panic_message(&*payload), "fiber callback panicked");
                }
            }

            yielder.suspend(Suspend::Finished);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl Fiber {
    /// Creates a fiber with the default config (128 KiB stack, scheduler-managed).
    pub fn new<F>(cb: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_config(cb, FiberConfig::default())
    }

    /// Creates a fiber that is resumed and yields against the thread's root
    /// fiber, for use outside any scheduler.
    pub fn standalone<F>(cb: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_config(
            cb,
            FiberConfig {
                runs_in_scheduler: false,
                ..FiberConfig::default()
            },
        )
    }

    pub fn with_config<F>(cb: F, config: FiberConfig) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_callback(Box::new(cb), config)
    }

    pub(crate) fn with_callback(cb: Callback, config: FiberConfig) -> Result<Arc<Fiber>> {
        let stack_size = if config.stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            config.stack_size
        };

        let stack = DefaultStack::new(stack_size).map_err(|source| Error::StackAllocation {
            size: stack_size,
            source,
        })?;
        let stack_base = stack.base().get();

        let slot = Arc::new(Slot {
            body: Mutex::new(Some(cb)),
            yielder: AtomicPtr::new(std::ptr::null_mut()),
        });
        let coroutine = Coroutine::with_stack(stack, trampoline(slot.clone()));

        let fiber = Fiber::from_parts(
            State::Ready,
            config.runs_in_scheduler,
            Some(Context {
                coroutine: UnsafeCell::new(coroutine),
                slot,
                stack_size,
                stack_base,
            }),
        );
        tracing::trace!(id = fiber.id, stack_size, "fiber created");
        Ok(Arc::new(fiber))
    }

    fn root() -> Fiber {
        Fiber::from_parts(State::Running, false, None)
    }

    fn from_parts(state: State, runs_in_scheduler: bool, context: Option<Context>) -> Fiber {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(state as u8),
            runs_in_scheduler,
            context,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn runs_in_scheduler(&self) -> bool {
        self.runs_in_scheduler
    }

    /// True for the synthetic fiber standing for a thread's native stack.
    pub fn is_root(&self) -> bool {
        self.context.is_none()
    }

    pub fn stack_size(&self) -> Option<usize> {
        self.context.as_ref().map(|c| c.stack_size)
    }

    /// Address of the top of the fiber's stack. Stable for the fiber's life.
    pub fn stack_base(&self) -> Option<usize> {
        self.context.as_ref().map(|c| c.stack_base)
    }

    /// Switches into the fiber until it yields or its callback returns.
    ///
    /// The caller must be the fiber's destination: the thread's scheduler
    /// loop for scheduler-managed fibers, the thread's root fiber otherwise.
    ///
    /// # Aborts
    ///
    /// If the fiber is not `Ready`, is a root fiber, or is resumed from any
    /// other context.
    pub fn resume(self: &Arc<Self>) {
        let Some(context) = &self.context else {
            fatal(Error::Misuse(format!(
                "fiber {} is a thread root fiber and cannot be resumed",
                self.id
            )))
        };

        let state = self.state();
        if state != State::Ready {
            fatal(Error::InvalidState {
                id: self.id,
                op: "resume",
                state,
            });
        }

        let previous = THREAD_FIBERS.with(|t| {
            let expected = if self.runs_in_scheduler {
                match &*t.scheduler.borrow() {
                    Some(main) => main.id,
                    None => fatal(Error::Misuse(format!(
                        "fiber {} runs in a scheduler but was resumed on a thread without one",
                        self.id
                    ))),
                }
            } else {
                t.root.id
            };

            let current = t.current.borrow().id;
            if current != expected {
                fatal(Error::Misuse(format!(
                    "fiber {} must be resumed from fiber {expected}, not from fiber {current}",
                    self.id
                )));
            }

            if let Err(actual) = self.state.compare_exchange(
                State::Ready as u8,
                State::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                fatal(Error::InvalidState {
                    id: self.id,
                    op: "resume",
                    state: State::from_u8(actual),
                });
            }

            t.current.replace(self.clone())
        });

        // SAFETY: winning the exchange above makes this thread the only one
        // allowed to touch the coroutine until the next state is published.
        let result = unsafe { (*context.coroutine.get()).resume(()) };

        THREAD_FIBERS.with(|t| *t.current.borrow_mut() = previous);

        let next = match result {
            CoroutineResult::Yield(Suspend::Yielded) => State::Ready,
            CoroutineResult::Yield(Suspend::Finished) => State::Dead,
            CoroutineResult::Return(never) => match never {},
        };
        self.state.store(next as u8, Ordering::Release);
    }

    /// Suspends the fiber and returns control to whoever resumed it.
    ///
    /// Must be called from the fiber's own stack.
    ///
    /// # Aborts
    ///
    /// If the fiber is not `Running`, is a root fiber, or is not the fiber
    /// currently executing on this thread.
    pub fn yield_now(&self) {
        let state = self.state();
        if state != State::Running {
            fatal(Error::InvalidState {
                id: self.id,
                op: "yield",
                state,
            });
        }

        let Some(context) = &self.context else {
            fatal(Error::Misuse(format!(
                "fiber {} is a thread root fiber and cannot yield",
                self.id
            )))
        };

        let current = Fiber::current_id();
        if current != self.id {
            fatal(Error::Misuse(format!(
                "fiber {} cannot yield from the stack of fiber {current}",
                self.id
            )));
        }

        let yielder = context.slot.yielder.load(Ordering::Acquire);
        // SAFETY: the trampoline stored the yielder before running any body,
        // and it lives at the base of the stack we are executing on.
        unsafe { (*yielder).suspend(Suspend::Yielded) };
    }

    /// Gives a dead fiber a new callback, reusing its stack.
    ///
    /// # Aborts
    ///
    /// If the fiber is not `Dead` or is a root fiber.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_callback(Box::new(cb));
    }

    pub(crate) fn reset_callback(&self, cb: Callback) {
        let Some(context) = &self.context else {
            fatal(Error::Misuse(format!(
                "fiber {} is a thread root fiber and cannot be reset",
                self.id
            )))
        };

        let mut body = context.slot.body.lock();
        if let Err(actual) = self.state.compare_exchange(
            State::Dead as u8,
            State::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            drop(body);
            fatal(Error::InvalidState {
                id: self.id,
                op: "reset",
                state: State::from_u8(actual),
            });
        }
        *body = Some(cb);
    }

    /// The fiber executing on the calling thread, creating the thread's root
    /// fiber on first use.
    pub fn current() -> Arc<Fiber> {
        THREAD_FIBERS.with(|t| t.current.borrow().clone())
    }

    pub fn current_id() -> u64 {
        THREAD_FIBERS.with(|t| t.current.borrow().id)
    }

    /// Number of fibers alive in the process, root fibers included.
    pub fn live_count() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);

        let state = self.state();
        if let Some(context) = self.context.as_mut() {
            if state != State::Dead && context.coroutine.get_mut().started() {
                // Unwinding a stack suspended inside user code would run its
                // destructors on whatever thread happens to drop it.
                tracing::error!(
                    id = self.id,
                    ?state,
                    "fiber dropped while suspended mid-callback"
                );
                std::process::abort();
            }
        }
        tracing::trace!(id = self.id, "fiber dropped");
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("runs_in_scheduler", &self.runs_in_scheduler)
            .field("root", &self.is_root())
            .finish()
    }
}

/// Yields the fiber running on this thread.
///
/// On a thread's root fiber there is nothing to switch back to, so this
/// falls back to yielding the OS thread.
pub fn yield_now() {
    // Only the raw yielder is taken out: holding a strong handle across the
    // switch would keep a fiber that is never resumed alive forever.
    let yielder = THREAD_FIBERS.with(|t| {
        t.current
            .borrow()
            .context
            .as_ref()
            .map(|c| c.slot.yielder.load(Ordering::Acquire))
    });

    match yielder {
        // SAFETY: see `Fiber::yield_now`; this is the current fiber's own stack.
        Some(yielder) => unsafe { (*yielder).suspend(Suspend::Yielded) },
        None => std::thread::yield_now(),
    }
}

/// Makes the calling thread's current fiber the destination for
/// scheduler-managed fibers until the guard drops.
pub(crate) struct SchedulerFiberGuard {
    previous: Option<Arc<Fiber>>,
    _not_send: PhantomData<*const ()>,
}

impl SchedulerFiberGuard {
    pub(crate) fn enter() -> (Self, Arc<Fiber>) {
        THREAD_FIBERS.with(|t| {
            let main = t.current.borrow().clone();
            let previous = t.scheduler.replace(Some(main.clone()));
            (
                SchedulerFiberGuard {
                    previous,
                    _not_send: PhantomData,
                },
                main,
            )
        })
    }
}

impl Drop for SchedulerFiberGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_FIBERS.with(|t| *t.scheduler.borrow_mut() = previous);
    }
}
