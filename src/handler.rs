// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scheduler deciding which observers run on the driver thread and which are
//! handed to the background thread on each fixed tick.

use crate::core::{ConcurrencyManager, ConcurrencyManagerBuilder};
use crate::error::ChildFault;
use crate::macros::{log_debug, log_error, log_info, log_trace, log_warn};
use crate::observer::{FixedObserver, Observer, ObserverKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A builder for [`UpdateHandler`].
#[derive(Clone, Debug)]
pub struct UpdateHandlerBuilder {
    /// Maximal time the driver waits for the background thread on each fixed
    /// tick.
    pub handoff_timeout: Duration,
    /// Number of consecutive handoff timeouts after which the background
    /// thread is stopped.
    pub max_consecutive_timeouts: usize,
    /// Configuration of the manager created for concurrent observers.
    pub manager: ConcurrencyManagerBuilder,
}

impl Default for UpdateHandlerBuilder {
    fn default() -> Self {
        Self {
            handoff_timeout: Duration::from_millis(100),
            max_consecutive_timeouts: 30,
            manager: ConcurrencyManagerBuilder::default(),
        }
    }
}

impl UpdateHandlerBuilder {
    /// Creates a handler without any observer.
    ///
    /// ```
    /// # use handoff::UpdateHandlerBuilder;
    /// # use std::time::Duration;
    /// let handler = UpdateHandlerBuilder {
    ///     handoff_timeout: Duration::from_millis(20),
    ///     max_consecutive_timeouts: 10,
    ///     ..Default::default()
    /// }
    /// .build();
    ///
    /// handler.update_fixed_observers(Duration::from_millis(20));
    /// assert_eq!(handler.current_fixed_time(), Duration::from_millis(20));
    /// ```
    pub fn build(&self) -> UpdateHandler {
        UpdateHandler {
            variable: Registry::new(),
            fixed: Registry::new(),
            concurrent: Registry::new(),
            handoff: Mutex::new(Handoff {
                manager: None,
                consecutive_timeouts: 0,
            }),
            batch: Arc::new(ConcurrentBatch::new()),
            clocks: Mutex::new(Clocks::default()),
            fault: Mutex::new(None),
            config: self.clone(),
        }
    }
}

/// Registry of observers driven by a tick source.
///
/// All methods take `&self`, so that observers holding a reference to their
/// handler can register or remove observers while being invoked. Each pass
/// runs on a snapshot taken when it starts, so these changes take effect on
/// the next pass.
///
/// Concurrent fixed observers run on a background thread owned by a
/// [`ConcurrencyManager`], which exists exactly while at least one concurrent
/// observer is registered. They must not register or remove fixed observers
/// themselves.
pub struct UpdateHandler {
    /// Observers driven on each variable tick.
    variable: Registry<dyn Observer>,
    /// Fixed observers driven on the driver thread.
    fixed: Registry<dyn FixedObserver>,
    /// Fixed observers driven on the background thread.
    concurrent: Registry<dyn FixedObserver>,
    /// Background thread state.
    handoff: Mutex<Handoff>,
    /// Concurrent pass published to the background thread.
    batch: Arc<ConcurrentBatch>,
    /// Clocks advanced by each tick.
    clocks: Mutex<Clocks>,
    /// Last fault reported by the background thread.
    fault: Mutex<Option<Arc<ChildFault>>>,
    /// Configuration of this handler.
    config: UpdateHandlerBuilder,
}

impl Default for UpdateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateHandler {
    /// Creates a handler with the default configuration.
    pub fn new() -> Self {
        UpdateHandlerBuilder::default().build()
    }

    /// Registers an observer for variable ticks. Registering the same observer
    /// again has no effect.
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.variable.insert(observer);
    }

    /// Unregisters an observer for variable ticks, if it was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer>) {
        self.variable.remove(observer);
    }

    /// Registers an observer for fixed ticks. Registering the same observer
    /// again has no effect.
    ///
    /// A concurrent observer creates the background thread's manager if none
    /// exists yet. The thread itself is started on the next fixed tick.
    pub fn add_fixed_observer(&self, observer: Arc<dyn FixedObserver>) {
        if !observer.is_concurrent() {
            self.fixed.insert(observer);
            return;
        }

        let mut concurrent = self.concurrent.lock();
        insert(&mut concurrent, observer);
        let mut handoff = lock(&self.handoff);
        if handoff.manager.is_none() {
            log_debug!("[driver] Creating the manager for concurrent observers");
            handoff.manager = Some(self.make_manager());
            handoff.consecutive_timeouts = 0;
        }
    }

    /// Unregisters an observer for fixed ticks, if it was registered.
    ///
    /// Removing the last concurrent observer stops the background thread and
    /// discards its manager.
    pub fn remove_fixed_observer(&self, observer: &Arc<dyn FixedObserver>) {
        if !observer.is_concurrent() {
            self.fixed.remove(observer);
            return;
        }

        let discarded = {
            let mut concurrent = self.concurrent.lock();
            remove(&mut concurrent, observer);
            if concurrent.is_empty() {
                lock(&self.handoff).manager.take()
            } else {
                None
            }
        };

        // Joined outside of the registry locks, which the background thread may
        // be waiting for.
        if let Some(mut manager) = discarded {
            log_debug!("[driver] No concurrent observer left, discarding the manager");
            let unreported = manager.is_errored() && manager.has_thread();
            manager.stop();
            if unreported {
                self.record_fault(manager.last_error());
            }
        }
    }

    /// Advances the variable clock and runs all the variable observers once.
    pub fn update_observers(&self, delta: Duration) {
        lock(&self.clocks).variable.advance(delta);
        for observer in self.variable.snapshot() {
            observer.update(delta);
        }
    }

    /// Advances the fixed clock, runs all the synchronous fixed observers once,
    /// and then gives the background thread its turn.
    pub fn update_fixed_observers(&self, delta: Duration) {
        lock(&self.clocks).fixed.advance(delta);
        for observer in self.fixed.snapshot() {
            observer.fixed_update(delta);
        }

        let concurrent = self.concurrent.snapshot();
        let mut handoff = lock(&self.handoff);
        self.handoff_cycle(&mut handoff, concurrent, delta);
    }

    /// Runs the concurrent observers published for the current fixed tick.
    ///
    /// This is the task run by the background thread on each of its turns.
    pub fn update_concurrent_fixed_observers(&self) {
        self.batch.run();
    }

    /// Returns the variable observers of the given kind.
    pub fn observers_of_kind(&self, kind: ObserverKind) -> Vec<Arc<dyn Observer>> {
        self.variable.filter(|observer| observer.kind() == kind)
    }

    /// Returns the fixed observers of the given kind, synchronous ones first.
    pub fn fixed_observers_of_kind(&self, kind: ObserverKind) -> Vec<Arc<dyn FixedObserver>> {
        let mut observers = self.fixed.filter(|observer| observer.kind() == kind);
        observers.extend(self.concurrent.filter(|observer| observer.kind() == kind));
        observers
    }

    /// Returns whether a manager exists for concurrent observers.
    pub fn has_concurrency_manager(&self) -> bool {
        lock(&self.handoff).manager.is_some()
    }

    /// Returns whether the background thread is running.
    pub fn is_concurrent_running(&self) -> bool {
        lock(&self.handoff)
            .manager
            .as_ref()
            .is_some_and(ConcurrencyManager::is_running)
    }

    /// Takes the last fault reported by the background thread.
    pub fn take_fault(&self) -> Option<Arc<ChildFault>> {
        lock(&self.fault).take()
    }

    /// Total time accumulated by variable ticks.
    pub fn current_time(&self) -> Duration {
        lock(&self.clocks).variable.current
    }

    /// Duration of the last variable tick.
    pub fn last_delta_time(&self) -> Duration {
        lock(&self.clocks).variable.last_delta
    }

    /// Total time accumulated by fixed ticks.
    pub fn current_fixed_time(&self) -> Duration {
        lock(&self.clocks).fixed.current
    }

    /// Duration of the last fixed tick.
    pub fn last_delta_fixed_time(&self) -> Duration {
        lock(&self.clocks).fixed.last_delta
    }

    fn record_fault(&self, fault: Option<Arc<ChildFault>>) {
        if let Some(_fault) = &fault {
            log_error!("[driver] Disabling concurrent observers after a fault: {_fault}");
        }
        *lock(&self.fault) = fault;
    }

    fn make_manager(&self) -> ConcurrencyManager {
        let batch = self.batch.clone();
        self.config.manager.build(move || {
            batch.run();
            Ok(())
        })
    }

    /// Performs one handoff cycle, or brings the manager to the state where the
    /// next tick can perform one.
    fn handoff_cycle(
        &self,
        handoff: &mut Handoff,
        concurrent: Vec<Arc<dyn FixedObserver>>,
        delta: Duration,
    ) {
        let Handoff {
            manager: slot,
            consecutive_timeouts,
        } = handoff;

        let Some(manager) = slot.as_mut() else {
            if !concurrent.is_empty() {
                log_debug!("[driver] Creating the manager for concurrent observers");
                *slot = Some(self.make_manager());
            }
            return;
        };

        if manager.is_running() {
            self.batch.publish(concurrent.into(), delta);
            manager.allow_child();
            if manager.wait_for_child(self.config.handoff_timeout) {
                *consecutive_timeouts = 0;
            } else {
                *consecutive_timeouts += 1;
                log_warn!(
                    "[driver] Concurrent pass timed out ({consecutive_timeouts}/{} in a row)",
                    self.config.max_consecutive_timeouts
                );
                if *consecutive_timeouts >= self.config.max_consecutive_timeouts {
                    log_error!(
                        "[driver] Background thread unresponsive for {consecutive_timeouts} ticks, stopping it"
                    );
                    manager.request_stop();
                    *consecutive_timeouts = 0;
                }
            }
        } else if manager.is_errored() {
            // Reported once: the joined thread isn't restarted.
            if manager.has_thread() {
                manager.stop();
                self.record_fault(manager.last_error());
            }
        } else if !manager.try_join() {
            log_trace!("[driver] Waiting for the stopped background thread to exit");
        } else {
            match manager.start() {
                Ok(()) => log_info!("[driver] Started the background thread"),
                Err(_e) => log_error!("[driver] Failed to start the background thread: {_e}"),
            }
        }
    }
}

/// Background thread state owned by the driver.
struct Handoff {
    /// Present exactly while concurrent observers are registered.
    manager: Option<ConcurrencyManager>,
    /// Number of consecutive fixed ticks whose handoff timed out.
    consecutive_timeouts: usize,
}

/// Pass handed to the background thread.
#[derive(Clone)]
struct BatchSnapshot {
    observers: Arc<[Arc<dyn FixedObserver>]>,
    delta: Duration,
}

/// Slot through which the driver publishes the concurrent pass.
struct ConcurrentBatch {
    current: Mutex<BatchSnapshot>,
}

impl ConcurrentBatch {
    fn new() -> Self {
        Self {
            current: Mutex::new(BatchSnapshot {
                observers: Vec::new().into(),
                delta: Duration::ZERO,
            }),
        }
    }

    fn publish(&self, observers: Arc<[Arc<dyn FixedObserver>]>, delta: Duration) {
        *lock(&self.current) = BatchSnapshot { observers, delta };
    }

    fn run(&self) {
        let snapshot = lock(&self.current).clone();
        for observer in snapshot.observers.iter() {
            observer.fixed_update(snapshot.delta);
        }
    }
}

#[derive(Default)]
struct Clocks {
    variable: Clock,
    fixed: Clock,
}

#[derive(Default)]
struct Clock {
    current: Duration,
    last_delta: Duration,
}

impl Clock {
    fn advance(&mut self, delta: Duration) {
        self.current += delta;
        self.last_delta = delta;
    }
}

/// A set of observers, deduplicated by identity.
struct Registry<T: ?Sized> {
    observers: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<T>>> {
        lock(&self.observers)
    }

    fn insert(&self, observer: Arc<T>) {
        insert(&mut self.lock(), observer);
    }

    fn remove(&self, observer: &Arc<T>) {
        remove(&mut self.lock(), observer);
    }

    fn snapshot(&self) -> Vec<Arc<T>> {
        self.lock().clone()
    }

    fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        self.lock()
            .iter()
            .filter(|observer| predicate(observer))
            .cloned()
            .collect()
    }
}

fn insert<T: ?Sized>(observers: &mut Vec<Arc<T>>, observer: Arc<T>) {
    if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
        observers.push(observer);
    }
}

fn remove<T: ?Sized>(observers: &mut Vec<Arc<T>>, observer: &Arc<T>) {
    observers.retain(|o| !Arc::ptr_eq(o, observer));
}

/// Observers never run while a lock is held, so a poisoned lock still guards
/// consistent data.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::thread::ThreadId;
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(16);
    const LONG: Duration = Duration::from_secs(10);

    fn patient_handler() -> UpdateHandler {
        UpdateHandlerBuilder {
            handoff_timeout: LONG,
            ..Default::default()
        }
        .build()
    }

    #[derive(Default)]
    struct Counter {
        count: AtomicUsize,
        concurrent: bool,
        kind: Option<ObserverKind>,
    }

    impl Counter {
        fn concurrent() -> Self {
            Self {
                concurrent: true,
                ..Default::default()
            }
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Observer for Counter {
        fn update(&self, _delta: Duration) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn kind(&self) -> ObserverKind {
            self.kind.unwrap_or(ObserverKind::ANONYMOUS)
        }
    }

    impl FixedObserver for Counter {
        fn fixed_update(&self, _delta: Duration) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn is_concurrent(&self) -> bool {
            self.concurrent
        }

        fn kind(&self) -> ObserverKind {
            self.kind.unwrap_or(ObserverKind::ANONYMOUS)
        }
    }

    /// Records where and how it was last invoked.
    struct Recorder {
        calls: Mutex<Vec<(ThreadId, Duration)>>,
    }

    impl FixedObserver for Recorder {
        fn fixed_update(&self, delta: Duration) {
            lock(&self.calls).push((std::thread::current().id(), delta));
        }

        fn is_concurrent(&self) -> bool {
            true
        }
    }

    struct Panicking;

    impl FixedObserver for Panicking {
        fn fixed_update(&self, _delta: Duration) {
            panic!("script error");
        }

        fn is_concurrent(&self) -> bool {
            true
        }
    }

    struct Sleeping(Duration);

    impl FixedObserver for Sleeping {
        fn fixed_update(&self, _delta: Duration) {
            std::thread::sleep(self.0);
        }

        fn is_concurrent(&self) -> bool {
            true
        }
    }

    /// Spins until released.
    struct Spinning {
        release: AtomicBool,
        passes: AtomicUsize,
    }

    impl FixedObserver for Spinning {
        fn fixed_update(&self, _delta: Duration) {
            while !self.release.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            self.passes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_concurrent(&self) -> bool {
            true
        }
    }

    /// Registers another observer on its first invocation.
    struct Registering {
        handler: Weak<UpdateHandler>,
        pending: Mutex<Option<Arc<dyn Observer>>>,
    }

    impl Observer for Registering {
        fn update(&self, _delta: Duration) {
            if let Some(observer) = lock(&self.pending).take() {
                self.handler.upgrade().unwrap().add_observer(observer);
            }
        }
    }

    /// Removes another observer on each invocation.
    struct Removing {
        handler: Weak<UpdateHandler>,
        target: Arc<dyn FixedObserver>,
    }

    impl FixedObserver for Removing {
        fn fixed_update(&self, _delta: Duration) {
            self.handler
                .upgrade()
                .unwrap()
                .remove_fixed_observer(&self.target);
        }
    }

    #[test]
    fn test_manager_exists_iff_concurrent_observers() {
        let handler = UpdateHandler::new();
        assert!(!handler.has_concurrency_manager());

        let sync: Arc<dyn FixedObserver> = Arc::new(Counter::default());
        handler.add_fixed_observer(sync.clone());
        assert!(!handler.has_concurrency_manager());

        let first: Arc<dyn FixedObserver> = Arc::new(Counter::concurrent());
        let second: Arc<dyn FixedObserver> = Arc::new(Counter::concurrent());
        handler.add_fixed_observer(first.clone());
        assert!(handler.has_concurrency_manager());
        handler.add_fixed_observer(second.clone());
        assert!(handler.has_concurrency_manager());

        handler.remove_fixed_observer(&first);
        assert!(handler.has_concurrency_manager());
        handler.remove_fixed_observer(&first);
        assert!(handler.has_concurrency_manager());
        handler.remove_fixed_observer(&second);
        assert!(!handler.has_concurrency_manager());

        handler.remove_fixed_observer(&sync);
        assert!(!handler.has_concurrency_manager());

        handler.add_fixed_observer(second.clone());
        assert!(handler.has_concurrency_manager());
    }

    #[test]
    fn test_removing_last_concurrent_observer_stops_thread() {
        let handler = patient_handler();
        let observer = Arc::new(Counter::concurrent());
        let dyn_observer: Arc<dyn FixedObserver> = observer.clone();
        handler.add_fixed_observer(dyn_observer.clone());

        handler.update_fixed_observers(TICK);
        assert!(handler.is_concurrent_running());
        handler.update_fixed_observers(TICK);
        assert_eq!(observer.count(), 1);

        handler.remove_fixed_observer(&dyn_observer);
        assert!(!handler.has_concurrency_manager());
        assert!(!handler.is_concurrent_running());

        handler.update_fixed_observers(TICK);
        assert_eq!(observer.count(), 1);
    }

    #[test]
    fn test_registration_is_idempotent() {
        let handler = patient_handler();

        let frame = Arc::new(Counter::default());
        let dyn_frame: Arc<dyn Observer> = frame.clone();
        handler.add_observer(dyn_frame.clone());
        handler.add_observer(dyn_frame.clone());

        let fixed = Arc::new(Counter::default());
        let dyn_fixed: Arc<dyn FixedObserver> = fixed.clone();
        handler.add_fixed_observer(dyn_fixed.clone());
        handler.add_fixed_observer(dyn_fixed.clone());

        let concurrent = Arc::new(Counter::concurrent());
        let dyn_concurrent: Arc<dyn FixedObserver> = concurrent.clone();
        handler.add_fixed_observer(dyn_concurrent.clone());
        handler.add_fixed_observer(dyn_concurrent.clone());

        handler.update_observers(TICK);
        // The first fixed tick starts the background thread, the second one runs
        // the concurrent observers.
        handler.update_fixed_observers(TICK);
        handler.update_fixed_observers(TICK);

        assert_eq!(frame.count(), 1);
        assert_eq!(fixed.count(), 2);
        assert_eq!(concurrent.count(), 1);
    }

    #[test]
    fn test_removing_unregistered_observer_is_noop() {
        let handler = UpdateHandler::new();
        let registered = Arc::new(Counter::default());
        handler.add_observer(registered.clone());

        let stranger: Arc<dyn Observer> = Arc::new(Counter::default());
        handler.remove_observer(&stranger);
        let fixed_stranger: Arc<dyn FixedObserver> = Arc::new(Counter::concurrent());
        handler.remove_fixed_observer(&fixed_stranger);

        handler.update_observers(TICK);
        assert_eq!(registered.count(), 1);
        assert!(!handler.has_concurrency_manager());
    }

    #[test]
    fn test_registration_during_pass_applies_to_next_pass() {
        let handler = Arc::new(UpdateHandler::new());
        let late = Arc::new(Counter::default());
        handler.add_observer(Arc::new(Registering {
            handler: Arc::downgrade(&handler),
            pending: Mutex::new(Some(late.clone() as Arc<dyn Observer>)),
        }));

        handler.update_observers(TICK);
        assert_eq!(late.count(), 0);

        handler.update_observers(TICK);
        assert_eq!(late.count(), 1);
    }

    #[test]
    fn test_removal_during_pass_applies_to_next_pass() {
        let handler = Arc::new(UpdateHandler::new());
        let victim = Arc::new(Counter::default());
        handler.add_fixed_observer(Arc::new(Removing {
            handler: Arc::downgrade(&handler),
            target: victim.clone(),
        }));
        handler.add_fixed_observer(victim.clone());

        handler.update_fixed_observers(TICK);
        assert_eq!(victim.count(), 1);

        handler.update_fixed_observers(TICK);
        assert_eq!(victim.count(), 1);
    }

    #[test]
    fn test_clocks_accumulate() {
        let handler = UpdateHandler::new();
        assert_eq!(handler.current_time(), Duration::ZERO);
        assert_eq!(handler.current_fixed_time(), Duration::ZERO);

        handler.update_observers(Duration::from_millis(10));
        handler.update_observers(Duration::from_millis(7));
        handler.update_fixed_observers(Duration::from_millis(20));

        assert_eq!(handler.current_time(), Duration::from_millis(17));
        assert_eq!(handler.last_delta_time(), Duration::from_millis(7));
        assert_eq!(handler.current_fixed_time(), Duration::from_millis(20));
        assert_eq!(handler.last_delta_fixed_time(), Duration::from_millis(20));
    }

    #[test]
    fn test_concurrent_observers_run_on_background_thread() {
        let handler = patient_handler();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        handler.add_fixed_observer(recorder.clone());

        handler.update_fixed_observers(Duration::from_millis(1));
        assert!(handler.is_concurrent_running());
        assert!(lock(&recorder.calls).is_empty());

        handler.update_fixed_observers(Duration::from_millis(2));
        handler.update_fixed_observers(Duration::from_millis(3));

        let calls = lock(&recorder.calls).clone();
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .all(|(thread, _)| *thread != std::thread::current().id()));
        assert_eq!(calls[0].0, calls[1].0);
        assert_eq!(calls[0].1, Duration::from_millis(2));
        assert_eq!(calls[1].1, Duration::from_millis(3));
    }

    #[test]
    fn test_concurrent_fault_disables_background_execution() {
        let handler = patient_handler();
        let sync = Arc::new(Counter::default());
        handler.add_fixed_observer(sync.clone());
        handler.add_fixed_observer(Arc::new(Panicking));

        // Start, then run the faulting pass.
        handler.update_fixed_observers(TICK);
        handler.update_fixed_observers(TICK);
        let deadline = Instant::now() + LONG;
        while handler.is_concurrent_running() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        // The fault is reported on the next tick, and the thread stays down.
        handler.update_fixed_observers(TICK);
        let fault = handler.take_fault().unwrap();
        assert_eq!(fault.to_string(), "concurrent task panicked: script error");

        for _ in 0..5 {
            handler.update_fixed_observers(TICK);
        }
        assert!(!handler.is_concurrent_running());
        assert!(handler.has_concurrency_manager());
        assert!(handler.take_fault().is_none());
        assert_eq!(sync.count(), 8);
    }

    #[test]
    fn test_consecutive_timeouts_force_stop() {
        let handler = UpdateHandlerBuilder {
            handoff_timeout: Duration::from_millis(1),
            max_consecutive_timeouts: 2,
            ..Default::default()
        }
        .build();
        handler.add_fixed_observer(Arc::new(Sleeping(Duration::from_millis(300))));

        handler.update_fixed_observers(TICK);
        assert!(handler.is_concurrent_running());

        handler.update_fixed_observers(TICK);
        assert!(handler.is_concurrent_running());
        handler.update_fixed_observers(TICK);
        assert!(!handler.is_concurrent_running());
        assert!(handler.has_concurrency_manager());
        assert!(handler.take_fault().is_none());

        // Not a fault: a tick restarts the background thread once the
        // sleeping pass has returned.
        let deadline = Instant::now() + LONG;
        while !handler.is_concurrent_running() {
            assert!(Instant::now() < deadline);
            handler.update_fixed_observers(TICK);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(handler.take_fault().is_none());
    }

    #[test]
    fn test_stuck_observer_does_not_block_driver() {
        let handler = UpdateHandlerBuilder {
            handoff_timeout: Duration::from_millis(10),
            max_consecutive_timeouts: 1,
            ..Default::default()
        }
        .build();
        let sync = Arc::new(Counter::default());
        let spinning = Arc::new(Spinning {
            release: AtomicBool::new(false),
            passes: AtomicUsize::new(0),
        });
        handler.add_fixed_observer(sync.clone());
        handler.add_fixed_observer(spinning.clone());

        handler.update_fixed_observers(TICK);
        assert!(handler.is_concurrent_running());

        // The escalating tick returns after its own handoff timeout.
        let start = Instant::now();
        handler.update_fixed_observers(TICK);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!handler.is_concurrent_running());

        // Later ticks keep running synchronous observers, without starting a
        // second background thread.
        let start = Instant::now();
        for _ in 0..10 {
            handler.update_fixed_observers(TICK);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!handler.is_concurrent_running());
        assert_eq!(sync.count(), 12);
        assert_eq!(spinning.passes.load(Ordering::SeqCst), 0);

        spinning.release.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + LONG;
        while !handler.is_concurrent_running() {
            assert!(Instant::now() < deadline);
            handler.update_fixed_observers(TICK);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(handler.take_fault().is_none());
    }

    #[test]
    fn test_fault_reported_when_last_concurrent_observer_removed() {
        let handler = patient_handler();
        let panicking: Arc<dyn FixedObserver> = Arc::new(Panicking);
        handler.add_fixed_observer(panicking.clone());

        // Start, then run the faulting pass.
        handler.update_fixed_observers(TICK);
        handler.update_fixed_observers(TICK);
        let deadline = Instant::now() + LONG;
        while handler.is_concurrent_running() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        handler.remove_fixed_observer(&panicking);
        assert!(!handler.has_concurrency_manager());
        let fault = handler.take_fault().unwrap();
        assert_eq!(fault.to_string(), "concurrent task panicked: script error");
        assert!(handler.take_fault().is_none());
    }

    #[test]
    fn test_lookup_by_kind() {
        const ENEMY: ObserverKind = ObserverKind("enemy");
        const SCRIPT: ObserverKind = ObserverKind("script");

        let handler = UpdateHandler::new();
        let enemy = Arc::new(Counter {
            kind: Some(ENEMY),
            ..Default::default()
        });
        let script = Arc::new(Counter {
            concurrent: true,
            kind: Some(SCRIPT),
            ..Default::default()
        });
        let other = Arc::new(Counter::default());

        handler.add_observer(enemy.clone());
        handler.add_observer(other.clone());
        handler.add_fixed_observer(enemy.clone());
        handler.add_fixed_observer(script.clone());
        handler.add_fixed_observer(other.clone());

        assert_eq!(handler.observers_of_kind(ENEMY).len(), 1);
        assert!(handler.observers_of_kind(SCRIPT).is_empty());
        assert_eq!(handler.fixed_observers_of_kind(ENEMY).len(), 1);

        let scripts = handler.fixed_observers_of_kind(SCRIPT);
        assert_eq!(scripts.len(), 1);
        let expected: Arc<dyn FixedObserver> = script.clone();
        assert!(Arc::ptr_eq(&scripts[0], &expected));

        assert_eq!(
            handler
                .fixed_observers_of_kind(ObserverKind::ANONYMOUS)
                .len(),
            1
        );
        // Lookups have no side effects.
        assert_eq!(enemy.count(), 0);
        assert_eq!(script.count(), 0);
    }

    #[test]
    fn test_update_concurrent_fixed_observers_inline() {
        let handler = patient_handler();
        let observer = Arc::new(Counter::concurrent());
        handler.add_fixed_observer(observer.clone());

        // Nothing is published before the first handoff.
        handler.update_concurrent_fixed_observers();
        assert_eq!(observer.count(), 0);

        handler.update_fixed_observers(TICK);
        handler.update_fixed_observers(TICK);
        assert_eq!(observer.count(), 1);

        handler.update_concurrent_fixed_observers();
        assert_eq!(observer.count(), 2);
    }
}
