//! Named OS threads with a startup rendezvous.
//!
//! [`Thread::spawn`] does not return until the new thread has recorded its OS
//! thread id and name, so the id is immediately usable as a task affinity.

use crate::error::{Error, Result};
use crate::semaphore::Semaphore;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::{self, JoinHandle};

/// OS-level thread identifier.
pub type Tid = i64;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(
        thread::current().name().unwrap_or("UNKNOWN").to_string(),
    );
}

/// Returns the kernel id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_tid() -> Tid {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

/// Returns a process-unique id for the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> Tid {
    static NEXT_TID: AtomicI64 = AtomicI64::new(1);
    thread_local! {
        static TID: Tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|tid| *tid)
}

/// A joinable, named OS thread.
pub struct Thread {
    id: Tid,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `f` on a new thread called `name`.
    ///
    /// Blocks until the thread has published its id and applied its name.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let ready = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI64::new(-1));

        let handle = {
            let ready = ready.clone();
            let tid = tid.clone();
            let thread_name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    tid.store(current_tid(), Ordering::Release);
                    Thread::set_current_name(&thread_name);
                    ready.notify();
                    f();
                })
                .map_err(|source| Error::Spawn {
                    name: name.clone(),
                    source,
                })?
        };

        ready.wait();

        Ok(Thread {
            id: tid.load(Ordering::Acquire),
            name,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> Tid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }

    pub fn current_id() -> Tid {
        current_tid()
    }

    pub fn current_name() -> String {
        THREAD_NAME.with(|name| name.borrow().clone())
    }

    /// Renames the calling thread as seen by [`Thread::current_name`].
    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|current| {
            let mut current = current.borrow_mut();
            current.clear();
            current.push_str(name);
        });
    }
}
