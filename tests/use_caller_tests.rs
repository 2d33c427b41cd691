use fibersched::thread::current_tid;
use fibersched::{Fiber, Scheduler, Tid, fiber};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_single_thread_runs_everything_on_caller() {
    let scheduler = Scheduler::new(1, true).unwrap();
    scheduler.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = counter.clone();
        scheduler.schedule(move || {
            assert_eq!(fibersched::Thread::current_name(), "Scheduler");
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    scheduler.stop().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn test_caller_plus_spawned_workers() {
    let scheduler = Scheduler::new(3, true).unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.spawned_threads(), 2);

    let workers = scheduler.worker_ids();
    assert_eq!(workers.len(), 3);
    assert_eq!(workers[0], current_tid());

    let ran_on: Arc<Mutex<Vec<Tid>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..300 {
        let ran_on = ran_on.clone();
        scheduler.schedule(move || ran_on.lock().push(current_tid()));
    }

    scheduler.stop().unwrap();
    let ran_on = ran_on.lock();
    assert_eq!(ran_on.len(), 300);
    let known: HashSet<Tid> = workers.into_iter().collect();
    assert!(ran_on.iter().all(|tid| known.contains(tid)));
}

#[test]
fn test_task_pinned_to_caller_runs_in_stop() {
    let scheduler = Scheduler::new(2, true).unwrap();
    scheduler.start().unwrap();

    let caller = current_tid();
    let seen = Arc::new(Mutex::new(None));
    let seen_clone = seen.clone();
    scheduler.schedule_on(caller, move || {
        *seen_clone.lock() = Some(current_tid());
    });

    std::thread::sleep(std::time::Duration::from_millis(20));
    // The spawned worker may not take it.
    assert_eq!(scheduler.pending_tasks(), 1);

    scheduler.stop().unwrap();
    assert_eq!(*seen.lock(), Some(caller));
}

#[test]
fn test_fiber_yields_inside_caller_loop() {
    let scheduler = Scheduler::new(1, true).unwrap();
    let handle = scheduler.handle();

    let rounds = Arc::new(AtomicUsize::new(0));
    let rounds_clone = rounds.clone();
    let fiber = Fiber::new(move || {
        for _ in 0..3 {
            rounds_clone.fetch_add(1, Ordering::SeqCst);
            handle.schedule_fiber(Fiber::current());
            fiber::yield_now();
        }
    })
    .unwrap();
    scheduler.schedule_fiber(fiber.clone());

    scheduler.stop().unwrap();
    assert_eq!(rounds.load(Ordering::SeqCst), 3);
    assert_eq!(fiber.state(), fibersched::State::Dead);
}

