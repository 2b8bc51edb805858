// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives shared by the driver thread and the background
//! (child) thread.
//!
//! The handshake uses two manual-reset gates. The driver gives the child its
//! turn by closing the parent gate and opening the child gate; the child hands
//! control back by closing the child gate and opening the parent gate. At most
//! one of the gates is open at any time, except during a parallel window where
//! the child keeps running without holding either.

use super::util::{Gate, Status};
use crate::error::{ChildFault, TaskResult};
use crate::macros::{log_debug, log_error, log_trace};
use crossbeam_utils::CachePadded;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// The unit of work run by the child thread on each of its turns.
pub(crate) type Task = Box<dyn FnMut() -> TaskResult + Send + 'static>;

/// State of the child thread after waiting for its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// The driver gave the child a new turn.
    Running,
    /// The driver asked the child to exit.
    Stopping,
}

/// Progress of the background thread's startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Startup {
    /// The thread hasn't reported anything yet.
    Pending,
    /// The thread is live and about to wait for its first turn.
    Live,
    /// The thread couldn't be pinned to a CPU and exited.
    PinningFailed(String),
}

/// Context shared between the driver thread and the child thread.
pub(crate) struct SharedContext {
    /// Whether the child loop must keep going.
    pub running: CachePadded<AtomicBool>,
    /// Whether the child declared a parallel window.
    pub parallel: CachePadded<AtomicBool>,
    /// Whether the task faulted during the current run.
    pub errored: CachePadded<AtomicBool>,
    /// Whether the child is inside a pass of the task.
    pub executing: AtomicBool,
    /// Number of driver-side waits that exceeded their deadline.
    pub timeout_count: CachePadded<AtomicUsize>,
    /// Fault captured from the last failed pass.
    pub last_error: Mutex<Option<Arc<ChildFault>>>,
    /// Gate on which the driver waits.
    pub parent_gate: Gate,
    /// Gate on which the child waits.
    pub child_gate: Gate,
    /// Startup report of the child thread.
    pub startup: Status<Startup>,
    /// The work run on each turn. Only the child thread locks it.
    pub task: Mutex<Task>,
}

impl SharedContext {
    pub fn new(task: Task) -> Self {
        Self {
            running: CachePadded::new(AtomicBool::new(false)),
            parallel: CachePadded::new(AtomicBool::new(false)),
            errored: CachePadded::new(AtomicBool::new(false)),
            executing: AtomicBool::new(false),
            timeout_count: CachePadded::new(AtomicUsize::new(0)),
            last_error: Mutex::new(None),
            parent_gate: Gate::closed(),
            child_gate: Gate::closed(),
            startup: Status::new(Startup::Pending),
            task: Mutex::new(task),
        }
    }

    /// Resets the protocol state before spawning a new child thread.
    pub fn reset(&self) {
        self.parallel.store(false, Ordering::SeqCst);
        self.errored.store(false, Ordering::SeqCst);
        self.executing.store(false, Ordering::SeqCst);
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.parent_gate.close();
        self.child_gate.close();
        self.startup.set(Startup::Pending);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<Arc<ChildFault>> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Child>> = const { RefCell::new(None) };
}

/// Handle to the child side of the handshake.
///
/// The task run by a [`ConcurrencyManager`](crate::ConcurrencyManager) obtains
/// this handle via [`Child::current()`], to open and close parallel windows.
#[derive(Clone)]
pub struct Child {
    shared: Arc<SharedContext>,
}

impl Child {
    pub(crate) fn new(shared: Arc<SharedContext>) -> Self {
        Self { shared }
    }

    /// Returns the handle of the manager owning the calling thread, or
    /// [`None`] if this isn't called from a manager's background thread.
    pub fn current() -> Option<Child> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Opens a parallel window: the driver is released immediately, and keeps
    /// going without waiting on this thread until the window is closed by
    /// [`wait_for_parent()`](Self::wait_for_parent).
    ///
    /// Calling this again within an open window has no further effect.
    pub fn allow_parent_parallel(&self) {
        log_trace!("[child thread] Entering a parallel window");
        // The child gate is closed first, so that a new turn given by the driver
        // once released isn't lost.
        self.shared.child_gate.close();
        self.shared.parallel.store(true, Ordering::SeqCst);
        self.shared.parent_gate.open();
    }

    /// Closes the parallel window if one is open, and blocks until the driver
    /// gives this thread its next turn.
    ///
    /// - If the driver called
    ///   [`allow_child()`](crate::ConcurrencyManager::allow_child), this
    ///   returns [`ChildState::Running`].
    /// - If the driver called [`stop()`](crate::ConcurrencyManager::stop), this
    ///   returns [`ChildState::Stopping`] and the task should return promptly.
    pub fn wait_for_parent(&self) -> ChildState {
        self.shared.parallel.store(false, Ordering::SeqCst);
        log_trace!("[child thread] Waiting for a turn");
        self.shared
            .child_gate
            .wait_unless(|| !self.shared.running.load(Ordering::SeqCst));
        if self.shared.running.load(Ordering::SeqCst) {
            ChildState::Running
        } else {
            ChildState::Stopping
        }
    }

    /// Returns whether a parallel window is open.
    pub fn is_parallel(&self) -> bool {
        self.shared.parallel.load(Ordering::SeqCst)
    }

    /// Returns whether the driver wants the child loop to keep going.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Reports that the thread couldn't be pinned to a CPU, instead of entering
    /// the loop.
    pub(crate) fn report_pinning_failure(&self, message: String) {
        log_error!("[child thread] {message}");
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared
            .startup
            .notify_all(Startup::PinningFailed(message));
    }

    /// Ends a synchronous pass by handing control back to the driver.
    fn allow_parent(&self) {
        self.shared.child_gate.close();
        self.shared.parent_gate.open();
    }

    /// Records a fault and releases the driver, which must never wait on a dead
    /// child.
    fn fail(&self, fault: ChildFault) {
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(fault));
        self.shared.errored.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.parallel.store(false, Ordering::SeqCst);
        self.shared.parent_gate.open();
    }

    /// Runs one pass of the task, capturing any error or panic.
    ///
    /// Returns whether the pass ended inside a parallel window. The window is
    /// closed before the pass is reported as finished, so that it never
    /// carries over to the next pass.
    fn run_task(&self) -> Result<bool, ChildFault> {
        let mut task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.executing.store(true, Ordering::SeqCst);
        let result = catch_unwind(AssertUnwindSafe(|| (*task)()));
        let window_open = self.shared.parallel.swap(false, Ordering::SeqCst);
        self.shared.executing.store(false, Ordering::SeqCst);
        match result {
            Ok(Ok(())) => Ok(window_open),
            Ok(Err(source)) => Err(ChildFault::Failed { source }),
            Err(payload) => Err(ChildFault::from_panic(payload)),
        }
    }

    /// Main function run by the child thread.
    pub(crate) fn run(self) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
        self.shared.startup.notify_all(Startup::Live);
        log_debug!("[child thread] Started.");

        loop {
            match self.wait_for_parent() {
                ChildState::Stopping => break,
                ChildState::Running => (),
            }
            log_trace!("[child thread] Received a turn. Processing...");

            let window_open = match self.run_task() {
                Ok(window_open) => window_open,
                Err(fault) => {
                    log_error!("[child thread] Task faulted, notifying the driver: {fault}");
                    self.fail(fault);
                    break;
                }
            };

            if !self.is_running() {
                log_debug!("[child thread] Stop requested during the pass");
                self.allow_parent();
                break;
            }

            if window_open {
                // The driver was already released when the window opened.
                log_trace!("[child thread] Pass ended inside a parallel window");
            } else {
                log_trace!("[child thread] Pass complete. Waking up the driver.");
                self.allow_parent();
            }
        }

        CURRENT.with(|current| current.borrow_mut().take());
        log_debug!("[child thread] Exiting.");
    }
}
