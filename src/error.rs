//! Error type shared by fibers, threads and the scheduler.
//!
//! Host-level failures (stack allocation, thread spawn) are returned to the
//! caller. State-machine violations are never returned: they are formatted
//! through this type, logged, and abort the process. Continuing would operate
//! on a corrupted execution context.

use crate::fiber::State;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to map a fiber stack.
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// The OS refused to create a worker thread.
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A fiber operation was attempted from the wrong state.
    #[error("fiber {id} cannot {op} while {state:?}")]
    InvalidState {
        id: u64,
        op: &'static str,
        state: State,
    },

    /// An API was used from a context that cannot support it.
    #[error("{0}")]
    Misuse(String),

    /// Joined worker threads ended in a panic.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked { count: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reports a broken invariant and aborts the process. Never returns.
///
/// Must not unwind: the fiber trampoline catches panics from callbacks.
#[cold]
#[track_caller]
pub(crate) fn fatal(err: Error) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(error = %err, %location, "fatal fiber runtime error");
    std::process::abort()
}
