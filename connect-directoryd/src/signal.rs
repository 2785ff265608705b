use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A value one thread publishes and others wait for, with a bounded wait.
#[derive(Debug)]
pub struct Signal<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, value: T) {
        *self.lock() = Some(value);
        self.ready.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = None;
    }

    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Wait up to `timeout` for a value; `None` when the wait elapsed
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
