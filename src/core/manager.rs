// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Driver side of the handoff protocol: owns the background thread.

use super::sync::{Child, SharedContext, Startup};
use crate::error::{ChildFault, HandoffError, TaskResult};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Policy to pin the background thread to a CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin the background thread.
    No,
    /// Pin the background thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin the background thread to a CPU. If CPU pinning isn't supported on
    /// this platform (or not implemented), starting the manager fails.
    Always,
}

/// A builder for [`ConcurrencyManager`].
#[derive(Clone, Debug)]
pub struct ConcurrencyManagerBuilder {
    /// Name given to the background thread.
    pub thread_name: String,
    /// Policy to pin the background thread to a CPU.
    pub cpu_pinning: CpuPinningPolicy,
    /// CPU to pin the background thread to, if pinning is enabled.
    pub cpu: usize,
    /// Maximal time to wait for the background thread to become live in
    /// [`start()`](ConcurrencyManager::start).
    pub startup_timeout: Duration,
}

impl Default for ConcurrencyManagerBuilder {
    fn default() -> Self {
        Self {
            thread_name: "handoff-child".to_owned(),
            cpu_pinning: CpuPinningPolicy::No,
            cpu: 0,
            startup_timeout: Duration::from_secs(1),
        }
    }
}

impl ConcurrencyManagerBuilder {
    /// Creates an idle manager running the given task on each turn of its
    /// background thread.
    ///
    /// ```
    /// # use handoff::{ConcurrencyManagerBuilder, CpuPinningPolicy};
    /// # use std::time::Duration;
    /// let mut manager = ConcurrencyManagerBuilder {
    ///     thread_name: "interpreter".to_owned(),
    ///     cpu_pinning: CpuPinningPolicy::IfSupported,
    ///     ..Default::default()
    /// }
    /// .build(|| Ok(()));
    ///
    /// manager.start().unwrap();
    /// manager.allow_child();
    /// assert!(manager.wait_for_child(Duration::from_secs(10)));
    /// manager.stop();
    /// ```
    pub fn build(&self, task: impl FnMut() -> TaskResult + Send + 'static) -> ConcurrencyManager {
        ConcurrencyManager {
            shared: Arc::new(SharedContext::new(Box::new(task))),
            thread: None,
            builder: self.clone(),
        }
    }
}

/// Owner of a background thread that runs a task in lock-step with the
/// driver thread.
///
/// Each handoff cycle is a call to [`allow_child()`](Self::allow_child)
/// followed by [`wait_for_child()`](Self::wait_for_child). Outside of parallel
/// windows, the task runs exactly once per cycle and the wait returns once it
/// has completed.
pub struct ConcurrencyManager {
    /// Context shared with the background thread.
    shared: Arc<SharedContext>,
    /// Handle to the background thread, present from `start()` until `stop()`.
    thread: Option<JoinHandle<()>>,
    /// Configuration used when starting the background thread.
    builder: ConcurrencyManagerBuilder,
}

impl ConcurrencyManager {
    /// Creates an idle manager with the default configuration.
    pub fn new(task: impl FnMut() -> TaskResult + Send + 'static) -> Self {
        ConcurrencyManagerBuilder::default().build(task)
    }

    /// Spawns the background thread, which then waits for its first turn.
    ///
    /// Fails if a background thread already exists, or if the thread couldn't
    /// be spawned, pinned or confirmed live. On failure the manager remains
    /// idle.
    pub fn start(&mut self) -> Result<(), HandoffError> {
        if self.thread.is_some() {
            log_error!("[driver] A background thread already exists");
            return Err(HandoffError::AlreadyStarted);
        }

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match self.builder.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                return Err(HandoffError::CpuPinning(
                    "Pinning threads to CPUs is not implemented on this platform.".to_owned(),
                ))
            }
        }

        self.shared.reset();

        let child = Child::new(self.shared.clone());
        let cpu_pinning = self.builder.cpu_pinning;
        let cpu = self.builder.cpu;
        let spawned = std::thread::Builder::new()
            .name(self.builder.thread_name.clone())
            .spawn(move || {
                if let Err(e) = pin_current_thread(cpu_pinning, cpu) {
                    child.report_pinning_failure(e);
                    return;
                }
                child.run()
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                log_error!("[driver] Failed to spawn the background thread: {e}");
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(HandoffError::Spawn(e));
            }
        };
        self.thread = Some(handle);

        let timeout = self.builder.startup_timeout;
        let (guard, _timed_out) = self
            .shared
            .startup
            .wait_timeout_while(timeout, |startup| *startup == Startup::Pending);
        let startup = guard.clone();
        drop(guard);

        match startup {
            Startup::Live => {
                log_debug!("[driver] Background thread started");
                Ok(())
            }
            Startup::Pending => {
                log_error!("[driver] Background thread didn't start within {timeout:?}");
                self.stop();
                Err(HandoffError::Unresponsive(timeout))
            }
            Startup::PinningFailed(message) => {
                self.stop();
                Err(HandoffError::CpuPinning(message))
            }
        }
    }

    /// Stops the background thread and joins it.
    ///
    /// This is a no-op if no background thread exists. A thread blocked waiting
    /// for its turn is released, but a pass in progress isn't interrupted:
    /// this returns once the task has returned control.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };

        self.notify_stop();
        let result = handle.join();
        match result {
            Ok(_) => log_debug!("[driver] Background thread joined with result: {result:?}"),
            Err(_) => log_error!("[driver] Background thread joined with result: {result:?}"),
        }
        self.shared.parallel.store(false, Ordering::SeqCst);
    }

    /// Asks the background thread to exit, without waiting for it.
    ///
    /// The thread object is kept until [`try_join()`](Self::try_join) or
    /// [`stop()`](Self::stop) reclaims it, so that no other thread can be
    /// started while this one is still inside a pass.
    pub fn request_stop(&self) {
        if self.thread.is_some() {
            self.notify_stop();
        }
    }

    /// Joins the background thread if it has exited.
    ///
    /// Returns whether no background thread remains. This never blocks on a
    /// thread still inside a pass.
    pub fn try_join(&mut self) -> bool {
        match &self.thread {
            None => true,
            Some(handle) if handle.is_finished() => {
                self.stop();
                true
            }
            Some(_) => false,
        }
    }

    fn notify_stop(&self) {
        log_debug!("[driver] Notifying the background thread to finish...");
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.child_gate.open();
    }

    /// Gives the background thread its turn. This never blocks.
    pub fn allow_child(&self) {
        log_trace!("[driver] Giving the background thread its turn");
        self.shared.parent_gate.close();
        self.shared.child_gate.open();
    }

    /// Waits until the background thread hands control back, for at most the
    /// given timeout.
    ///
    /// Returns immediately if the background thread is inside a parallel
    /// window. Returns `false` if the timeout elapsed, in which case the
    /// background thread keeps running and [`timeout_count()`](Self::timeout_count)
    /// is incremented.
    pub fn wait_for_child(&self, timeout: Duration) -> bool {
        if self.shared.parallel.load(Ordering::SeqCst) {
            log_trace!("[driver] Background thread is in a parallel window, not waiting");
            return true;
        }
        if self.shared.parent_gate.wait_timeout(timeout) {
            log_trace!("[driver] Background thread handed control back");
            true
        } else {
            let _count = self.shared.timeout_count.fetch_add(1, Ordering::SeqCst) + 1;
            log_warn!("[driver] Background thread didn't hand control back within {timeout:?} ({_count} timeouts so far)");
            false
        }
    }

    /// Returns whether a background thread object exists.
    pub fn has_thread(&self) -> bool {
        self.thread.is_some()
    }

    /// Returns whether the background thread is running its loop.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns whether the background thread is inside a parallel window.
    pub fn is_parallel(&self) -> bool {
        self.shared.parallel.load(Ordering::SeqCst)
    }

    /// Returns whether the task faulted since the last
    /// [`start()`](Self::start).
    pub fn is_errored(&self) -> bool {
        self.shared.errored.load(Ordering::SeqCst)
    }

    /// Returns whether the background thread is currently inside a pass of the
    /// task. This is informational only.
    pub fn is_executing_child(&self) -> bool {
        self.shared.executing.load(Ordering::SeqCst)
    }

    /// Returns the number of calls to
    /// [`wait_for_child()`](Self::wait_for_child) that timed out since this
    /// manager was created.
    pub fn timeout_count(&self) -> usize {
        self.shared.timeout_count.load(Ordering::SeqCst)
    }

    /// Returns the fault captured since the last [`start()`](Self::start), if
    /// any.
    pub fn last_error(&self) -> Option<Arc<ChildFault>> {
        self.shared.last_error()
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pins the calling thread according to the given policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(cpu_pinning: CpuPinningPolicy, cpu: usize) -> Result<(), String> {
    let pin = || -> nix::Result<()> {
        let mut cpu_set = CpuSet::new();
        cpu_set.set(cpu)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    };
    match cpu_pinning {
        CpuPinningPolicy::No => Ok(()),
        CpuPinningPolicy::IfSupported => {
            match pin() {
                Ok(()) => log_debug!("Pinned the background thread to CPU #{cpu}"),
                Err(_e) => {
                    log_warn!("Failed to set CPU affinity for the background thread: {_e}")
                }
            }
            Ok(())
        }
        CpuPinningPolicy::Always => match pin() {
            Ok(()) => {
                log_debug!("Pinned the background thread to CPU #{cpu}");
                Ok(())
            }
            Err(e) => Err(format!(
                "Failed to set CPU affinity for the background thread: {e}"
            )),
        },
    }
}

/// Pinning isn't implemented here, which was already reported by
/// [`ConcurrencyManager::start()`].
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_cpu_pinning: CpuPinningPolicy, _cpu: usize) -> Result<(), String> {
    Ok(())
}
