use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};
use types::TaskId;

/// Single-word doorbell handing execution from one thread to another.
///
/// The word is 0 while parked and 1 once signaled. `wait` blocks until the
/// word is signaled and consumes the signal on the way out, so each `signal`
/// releases exactly one pass through `wait`.
#[derive(Debug, Default)]
pub struct HandoffLock {
    state: Mutex<u32>,
    doorbell: Condvar,
}

impl HandoffLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while *state == 0 {
            self.doorbell.wait(&mut state);
        }
        *state = 0;
    }

    pub fn signal(&self, waiters: u32) {
        let mut state = self.state.lock();
        *state = 1;
        drop(state);
        for _ in 0..waiters {
            self.doorbell.notify_one();
        }
    }
}

/// Records which task a runner was switched away from.
///
/// The waking side must store here *before* signaling the handoff lock; the
/// woken side loads after `wait` returns and sees the store.
#[derive(Debug, Default)]
pub struct LastTask(AtomicU32);

impl LastTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, task: TaskId) {
        self.0.store(task.0, Ordering::Release);
    }

    pub fn load(&self) -> TaskId {
        TaskId(self.0.load(Ordering::Acquire))
    }
}

/// Reply cell for a blocking console read. Holds −1 while the request is
/// pending; `complete` stores the transferred byte count and wakes the
/// reader. Handles are cheap to clone so the cell can travel in a message.
#[derive(Debug, Clone, Default)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

#[derive(Debug, Default)]
struct MessengerInner {
    value: Mutex<i32>,
    ready: Condvar,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a request pending. Call before publishing the request so the
    /// reply cannot be missed.
    pub fn reset(&self) {
        *self.inner.value.lock() = -1;
    }

    pub fn complete(&self, count: i32) {
        let mut value = self.inner.value.lock();
        *value = count;
        drop(value);
        self.inner.ready.notify_all();
    }

    pub fn wait(&self) -> i32 {
        let mut value = self.inner.value.lock();
        while *value == -1 {
            self.inner.ready.wait(&mut value);
        }
        *value
    }
}
