use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// All driver state is kept consistent at every unlock, so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wakeup point for threads blocked on job completion.
///
/// Waiters re-check their own predicate after every wakeup, so a notification never has to be
/// matched to a particular waiter and spurious wakeups are harmless.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_all(&self) {
        *lock(&self.generation) += 1;
        self.cond.notify_all();
    }

    /// Blocks until `done()` holds or `timeout` elapses. Returns the final value of `done()`.
    pub fn wait_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.generation);
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
