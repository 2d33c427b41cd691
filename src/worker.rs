//! The per-worker scheduler loop.
//!
//! Every worker thread, and the caller's root scheduler fiber in
//! caller-participates mode, runs [`run`] until its idle fiber dies. The idle
//! fiber only dies once the scheduler is stopping with nothing queued and
//! nothing in flight, so no worker exits while another may still produce
//! work for it.

use crate::error::fatal;
use crate::fiber::{self, Fiber, SchedulerFiberGuard, State};
use crate::scheduler::Shared;
use crate::task::Work;
use crate::thread::current_tid;
use crossbeam::utils::Backoff;
use std::sync::Arc;

/// Runs the worker loop on the calling thread until shutdown.
///
/// Failing to allocate a fiber stack here is fatal.
pub(crate) fn run(shared: Arc<Shared>) {
    let tid = current_tid();
    // Fibers resumed from here yield back to the fiber running this loop.
    let (_scheduler_fiber, main) = SchedulerFiberGuard::enter();
    tracing::debug!(
        scheduler = %shared.name(),
        tid,
        main_fiber = main.id(),
        "worker loop started"
    );

    let config = shared.fiber_config();
    let idle_shared = shared.clone();
    let idle_fiber = match Fiber::with_config(move || idle(&idle_shared), config.clone()) {
        Ok(fiber) => fiber,
        Err(err) => fatal(err),
    };
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let (task, tickle_me) = shared.claim(tid);
        if tickle_me {
            shared.tickle();
        }

        match task.map(|task| task.work) {
            Some(Work::Fiber(fiber)) => {
                fiber.resume();
                shared.finish_task();
            }
            Some(Work::Callback(cb)) => {
                let fiber = match cb_fiber.take() {
                    Some(fiber) if fiber.state() == State::Dead => {
                        fiber.reset_callback(cb);
                        fiber
                    }
                    _ => match Fiber::with_callback(cb, config.clone()) {
                        Ok(fiber) => fiber,
                        Err(err) => fatal(err),
                    },
                };

                fiber.resume();
                shared.finish_task();

                // A callback that yielded is owned by whoever rescheduled it.
                if fiber.state() == State::Dead {
                    cb_fiber = Some(fiber);
                }
            }
            None => {
                if idle_fiber.state() == State::Dead {
                    tracing::debug!(tid, "idle fiber finished");
                    break;
                }
                shared.enter_idle();
                idle_fiber.resume();
                shared.leave_idle();
            }
        }
    }

    tracing::debug!(scheduler = %shared.name(), tid, "worker loop finished");
}

/// Idle fiber body: hand control back until the scheduler may shut down.
fn idle(shared: &Shared) {
    tracing::trace!("idle");
    let backoff = Backoff::new();
    while !shared.stopping() {
        backoff.snooze();
        fiber::yield_now();
    }
}
