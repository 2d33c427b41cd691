//! # fibersched - Stackful Fibers on an M:N Scheduler
//!
//! A user-space cooperative coroutine runtime. Callbacks run as lightweight
//! stackful fibers that can suspend mid-execution and be resumed later, and a
//! scheduler multiplexes any number of them over a fixed pool of OS worker
//! threads.
//!
//! ## Architecture
//!
//! - **Fibers**: execution contexts with their own stack, driven through
//!   `resume` and `yield`. Usable stand-alone or under a scheduler.
//! - **Task queue**: one shared FIFO of fibers and callbacks, each with an
//!   optional worker-thread affinity.
//! - **Workers**: OS threads running the scheduler loop. Each owns an idle
//!   fiber that spins until the scheduler shuts down.
//!
//! Scheduling is cooperative: a fiber runs until it yields or returns.
//!
//! ## Example
//!
//! ```no_run
//! use fibersched::{Scheduler, fiber};
//!
//! let scheduler = Scheduler::new(4, false).unwrap();
//! scheduler.start().unwrap();
//!
//! scheduler.schedule(|| {
//!     println!("first half");
//!     fiber::yield_now();
//!     println!("second half");
//! });
//!
//! scheduler.stop().unwrap();
//! ```

pub mod error;
pub mod fiber;
pub mod scheduler;
pub mod semaphore;
pub mod task;
pub mod thread;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning spawned worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to even-numbered logical processors only, avoiding SMT siblings.
    AvoidSMT,
}

impl PinningStrategy {
    /// Core for the `index`-th spawned worker, wrapping when there are more
    /// workers than cores.
    pub fn core_for(
        &self,
        index: usize,
        cores: &[core_affinity::CoreId],
    ) -> Option<core_affinity::CoreId> {
        if cores.is_empty() {
            return None;
        }
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(cores[index % cores.len()]),
            PinningStrategy::AvoidSMT => {
                let physical = cores.len().div_ceil(2);
                Some(cores[(index % physical) * 2])
            }
        }
    }
}

pub use error::{Error, Result};
pub use fiber::{Fiber, FiberConfig, State};
pub use scheduler::{Handle, NoopTickle, Scheduler, SchedulerConfig, Tickle};
pub use semaphore::Semaphore;
pub use task::{Affinity, Task, Work};
pub use thread::{Thread, Tid};
