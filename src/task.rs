//! Units of work queued on a scheduler.

use crate::fiber::{Callback, Fiber, State};
use crate::thread::Tid;
use std::sync::Arc;

/// Which worker may run a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Any worker.
    #[default]
    Any,
    /// Only the worker whose OS thread id matches.
    Thread(Tid),
}

impl Affinity {
    pub fn admits(&self, tid: Tid) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Thread(pinned) => *pinned == tid,
        }
    }
}

/// What a task runs: an existing fiber, or a callback the worker wraps in one.
pub enum Work {
    Fiber(Arc<Fiber>),
    Callback(Callback),
}

impl Work {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Work {
    fn from(fiber: Arc<Fiber>) -> Self {
        Work::Fiber(fiber)
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Work::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A queued unit of work together with its affinity.
#[derive(Debug)]
pub struct Task {
    pub(crate) work: Work,
    pub(crate) affinity: Affinity,
}

impl Task {
    pub fn new(work: Work, affinity: Affinity) -> Self {
        Task { work, affinity }
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Whether a worker on `tid` may claim this task right now.
    ///
    /// A fiber still running elsewhere stays queued until its resumer has
    /// switched back out of it.
    pub(crate) fn claimable_by(&self, tid: Tid) -> bool {
        if !self.affinity.admits(tid) {
            return false;
        }
        match &self.work {
            Work::Fiber(fiber) => fiber.state() != State::Running,
            Work::Callback(_) => true,
        }
    }
}
