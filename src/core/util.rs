// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status. A poisoned mutex is recovered, as the protected
    /// values are plain flags that are always left in a consistent state.
    fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.lock() = t;
        self.condvar.notify_all();
    }

    /// Sets the status to the given value without notifying anyone.
    pub fn set(&self, t: T) {
        *self.lock() = t;
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.lock(), predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the predicate is false on this status, or until the timeout
    /// elapses.
    ///
    /// Alongside the [`MutexGuard`], this returns whether the timeout elapsed
    /// with the predicate still true.
    pub fn wait_timeout_while(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'_, T>, bool) {
        let (guard, result) = self
            .condvar
            .wait_timeout_while(self.lock(), timeout, predicate)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }
}

#[cfg(test)]
impl<T: Copy> Status<T> {
    /// Returns a copy of the current status.
    pub fn get(&self) -> T {
        *self.lock()
    }
}

/// A binary signal that is either open or closed.
///
/// Opening the gate wakes up all the threads waiting on it. Waiting doesn't
/// consume the open state: the gate stays open until explicitly closed.
pub struct Gate {
    status: Status<bool>,
}

impl Gate {
    /// Creates a new closed gate.
    pub fn closed() -> Self {
        Self {
            status: Status::new(false),
        }
    }

    /// Opens the gate, releasing all the waiting threads.
    pub fn open(&self) {
        self.status.notify_all(true);
    }

    /// Closes the gate.
    pub fn close(&self) {
        self.status.set(false);
    }

    /// Returns whether the gate is currently open.
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.status.get()
    }

    /// Blocks until the gate is open or the `cancel` condition holds.
    ///
    /// Whoever makes `cancel` true must then open (or reopen) the gate, to wake
    /// up the waiting threads.
    pub fn wait_unless(&self, cancel: impl Fn() -> bool) {
        let _guard = self.status.wait_while(|open| !*open && !cancel());
    }

    /// Blocks until the gate is open or the timeout elapses. Returns whether
    /// the gate was observed open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (_guard, timed_out) = self.status.wait_timeout_while(timeout, |open| !*open);
        !timed_out
    }
}
