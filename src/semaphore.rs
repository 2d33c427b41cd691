//! Counting semaphore used for the thread startup rendezvous.

use parking_lot::{Condvar, Mutex};

/// A classic counting semaphore.
///
/// `parking_lot` primitives cannot fail to initialize or signal, so unlike a
/// POSIX `sem_t` there is no error path on any operation.
pub struct Semaphore {
    count: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter.
    pub fn notify(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new(0)
    }
}
