//! Broken invariants abort the process, so each case runs in a child copy of
//! this test binary and the parent checks how the child died.

use fibersched::{Fiber, FiberConfig, Scheduler, SchedulerConfig, fiber};
use std::process::{Command, Output};
use std::sync::Arc;

const CHILD_ENV: &str = "FIBERSCHED_FATAL_CHILD";

/// True when running as the child; installs a plain stderr subscriber so the
/// fatal log line reaches the parent.
fn in_child() -> bool {
    if std::env::var_os(CHILD_ENV).is_none() {
        return false;
    }
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
    true
}

fn run_child(name: &str) -> Output {
    Command::new(std::env::current_exe().expect("test binary path"))
        .args(["--exact", name, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("failed to run child test")
}

fn assert_aborts(name: &str, message: &str) {
    let output = run_child(name);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "{name} exited cleanly:\n{stderr}");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(
            output.status.signal(),
            Some(libc::SIGABRT),
            "{name} did not abort:\n{stderr}"
        );
    }
    assert!(stderr.contains(message), "{name}: expected `{message}` in:\n{stderr}");
}

#[test]
fn resume_dead_fiber_child() {
    if !in_child() {
        return;
    }
    let fiber = Fiber::standalone(|| {}).unwrap();
    fiber.resume();
    fiber.resume();
}

#[test]
fn test_resume_dead_fiber_aborts() {
    assert_aborts("resume_dead_fiber_child", "cannot resume while Dead");
}

#[test]
fn resume_running_fiber_child() {
    if !in_child() {
        return;
    }
    let fiber = Fiber::standalone(|| Fiber::current().resume()).unwrap();
    fiber.resume();
}

#[test]
fn test_resume_running_fiber_aborts() {
    assert_aborts("resume_running_fiber_child", "cannot resume while Running");
}

#[test]
fn yield_ready_fiber_child() {
    if !in_child() {
        return;
    }
    let fiber = Fiber::standalone(|| {}).unwrap();
    fiber.yield_now();
}

#[test]
fn test_yield_ready_fiber_aborts() {
    assert_aborts("yield_ready_fiber_child", "cannot yield while Ready");
}

#[test]
fn reset_live_fiber_child() {
    if !in_child() {
        return;
    }
    let fiber = Fiber::standalone(|| {}).unwrap();
    fiber.reset(|| {});
}

#[test]
fn test_reset_live_fiber_aborts() {
    assert_aborts("reset_live_fiber_child", "cannot reset while Ready");
}

#[test]
fn resume_root_fiber_child() {
    if !in_child() {
        return;
    }
    Fiber::current().resume();
}

#[test]
fn test_resume_root_fiber_aborts() {
    assert_aborts("resume_root_fiber_child", "cannot be resumed");
}

#[test]
fn scheduler_fiber_without_scheduler_child() {
    if !in_child() {
        return;
    }
    let fiber = Fiber::new(|| {}).unwrap();
    fiber.resume();
}

#[test]
fn test_scheduler_fiber_without_scheduler_aborts() {
    assert_aborts("scheduler_fiber_without_scheduler_child", "without one");
}

#[test]
fn nested_resume_child() {
    if !in_child() {
        return;
    }
    let outer = Fiber::standalone(|| {
        let inner = Fiber::standalone(|| {}).unwrap();
        // Stand-alone fibers return to the thread root, not to this fiber.
        inner.resume();
    })
    .unwrap();
    outer.resume();
}

#[test]
fn test_nested_resume_aborts() {
    assert_aborts("nested_resume_child", "must be resumed from fiber");
}

#[test]
fn dead_fiber_claimed_by_worker_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(2, false).unwrap();
    let fiber = Fiber::new(|| {}).unwrap();
    scheduler.schedule_fiber(fiber.clone());
    scheduler.schedule_fiber(fiber);
    scheduler.start().unwrap();
    scheduler.stop().unwrap();
}

#[test]
fn test_dead_fiber_claimed_by_worker_aborts() {
    assert_aborts("dead_fiber_claimed_by_worker_child", "cannot resume while Dead");
}

#[test]
fn dead_fiber_claimed_by_caller_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(1, true).unwrap();
    let fiber = Fiber::new(|| {}).unwrap();
    scheduler.schedule_fiber(fiber.clone());
    scheduler.schedule_fiber(fiber);
    scheduler.stop().unwrap();
}

#[test]
fn test_dead_fiber_claimed_by_caller_aborts() {
    assert_aborts("dead_fiber_claimed_by_caller_child", "cannot resume while Dead");
}

#[test]
fn zero_threads_child() {
    if !in_child() {
        return;
    }
    let _ = Scheduler::new(0, false);
}

#[test]
fn test_zero_threads_aborts() {
    assert_aborts("zero_threads_child", "at least one thread");
}

#[test]
fn schedule_after_stop_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(1, false).unwrap();
    scheduler.start().unwrap();
    scheduler.stop().unwrap();
    scheduler.schedule(|| {});
}

#[test]
fn test_schedule_after_stop_aborts() {
    assert_aborts("schedule_after_stop_child", "accepts no more tasks");
}

#[test]
fn schedule_dead_fiber_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(1, false).unwrap();
    let fiber = Fiber::new(|| {}).unwrap();
    scheduler.schedule_fiber(fiber.clone());
    scheduler.start().unwrap();
    scheduler.stop().unwrap();

    let again = Scheduler::new(1, false).unwrap();
    again.schedule_fiber(fiber);
}

#[test]
fn test_schedule_dead_fiber_aborts() {
    assert_aborts("schedule_dead_fiber_child", "cannot be scheduled while Dead");
}

#[test]
fn schedule_standalone_fiber_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(1, false).unwrap();
    scheduler.schedule_fiber(Fiber::standalone(|| {}).unwrap());
}

#[test]
fn test_schedule_standalone_fiber_aborts() {
    assert_aborts(
        "schedule_standalone_fiber_child",
        "not created to run in a scheduler",
    );
}

#[test]
fn stop_from_worker_child() {
    if !in_child() {
        return;
    }
    let scheduler = Arc::new(Scheduler::new(2, false).unwrap());
    scheduler.start().unwrap();
    let inner = scheduler.clone();
    scheduler.schedule(move || {
        let _ = inner.stop();
    });
    let _ = scheduler.stop();
}

#[test]
fn test_stop_from_worker_aborts() {
    assert_aborts(
        "stop_from_worker_child",
        "cannot be stopped from one of its own workers",
    );
}

#[test]
fn stop_from_other_thread_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(1, true).unwrap();
    std::thread::scope(|s| {
        let _ = s.spawn(|| scheduler.stop()).join();
    });
}

#[test]
fn test_stop_from_other_thread_aborts() {
    assert_aborts(
        "stop_from_other_thread_child",
        "only the thread that created it",
    );
}

#[test]
fn worker_stack_allocation_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::with_config(SchedulerConfig {
        threads: 1,
        use_caller: false,
        stack_size: 1 << 50,
        ..SchedulerConfig::default()
    })
    .unwrap();
    scheduler.start().unwrap();
    scheduler.schedule(|| {});
    let _ = scheduler.stop();
}

#[test]
fn test_worker_stack_allocation_aborts() {
    assert_aborts("worker_stack_allocation_child", "failed to allocate");
}

#[test]
fn drop_suspended_fiber_child() {
    if !in_child() {
        return;
    }
    let fiber = Fiber::with_config(
        fiber::yield_now,
        FiberConfig {
            runs_in_scheduler: false,
            ..FiberConfig::default()
        },
    )
    .unwrap();
    fiber.resume();
    drop(fiber);
}

#[test]
fn test_drop_suspended_fiber_aborts() {
    assert_aborts("drop_suspended_fiber_child", "suspended mid-callback");
}

#[test]
fn repeated_stop_from_other_thread_child() {
    if !in_child() {
        return;
    }
    let scheduler = Scheduler::new(1, true).unwrap();
    scheduler.stop().unwrap();
    std::thread::scope(|s| {
        let _ = s.spawn(|| scheduler.stop()).join();
    });
}

#[test]
fn test_repeated_stop_from_other_thread_aborts() {
    assert_aborts(
        "repeated_stop_from_other_thread_child",
        "only the thread that created it",
    );
}
