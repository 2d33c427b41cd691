use fibersched::{Fiber, Scheduler, SchedulerConfig, Thread, fiber};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("fibersched - Stackful Fibers on an M:N Scheduler\n");

    // Example 1: a stand-alone fiber driven by hand
    println!("Example 1: Resume and yield");
    let steps = Arc::new(Mutex::new(Vec::new()));
    let steps_clone = steps.clone();
    let standalone = match Fiber::standalone(move || {
        steps_clone.lock().push("first half");
        fiber::yield_now();
        steps_clone.lock().push("second half");
    }) {
        Ok(fiber) => fiber,
        Err(e) => {
            eprintln!("Fiber creation error: {}", e);
            return;
        }
    };
    standalone.resume();
    println!("  After first resume: {:?} ({:?})", steps.lock(), standalone.state());
    standalone.resume();
    println!("  After second resume: {:?} ({:?})\n", steps.lock(), standalone.state());

    // Example 2: parallel callbacks on spawned workers
    let num_threads = 4;
    let scheduler = match Scheduler::with_config(SchedulerConfig {
        name: "demo".to_string(),
        threads: num_threads,
        use_caller: false,
        ..SchedulerConfig::default()
    }) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("Scheduler creation error: {}", e);
            return;
        }
    };
    if let Err(e) = scheduler.start() {
        eprintln!("Start error: {}", e);
        return;
    }
    println!("Example 2: Parallel computation on {} workers", num_threads);

    let sum = Arc::new(AtomicUsize::new(0));
    let num_tasks = 10_000;
    let start = Instant::now();
    for i in 0..num_tasks {
        let sum = sum.clone();
        scheduler.schedule(move || {
            sum.fetch_add(i, Ordering::Relaxed);
        });
    }

    // Example 3: a task that yields and comes back on another pass
    let handle = scheduler.handle();
    scheduler.schedule(move || {
        println!("  [{}] yielding task: before", Thread::current_name());
        handle.schedule_fiber(Fiber::current());
        fiber::yield_now();
        println!("  [{}] yielding task: after", Thread::current_name());
    });

    println!("Shutting down scheduler...");
    match scheduler.stop() {
        Ok(_) => {
            let duration = start.elapsed();
            let expected: usize = (0..num_tasks).sum();
            println!("  Executed {} tasks in {:?}", num_tasks, duration);
            println!(
                "  Sum result: {} (expected: {})",
                sum.load(Ordering::Relaxed),
                expected
            );
            println!("Done!");
        }
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}
