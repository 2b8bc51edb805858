// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Units of work driven by an [`UpdateHandler`](crate::UpdateHandler).

use std::fmt;
use std::time::Duration;

/// Key under which an observer can be looked up, declared by the observer
/// itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverKind(pub &'static str);

impl ObserverKind {
    /// Kind of observers that don't declare one.
    pub const ANONYMOUS: ObserverKind = ObserverKind("");
}

impl fmt::Display for ObserverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A unit of work driven once per variable-rate (frame) tick.
pub trait Observer: Send + Sync {
    /// Runs this observer for a frame that lasted `delta`.
    fn update(&self, delta: Duration);

    /// Returns the lookup key of this observer.
    fn kind(&self) -> ObserverKind {
        ObserverKind::ANONYMOUS
    }

    /// Releases the resources held by this observer. This is never called by
    /// the handler itself.
    fn dispose(&self) {}
}

/// A unit of work driven once per fixed-rate tick.
///
/// Concurrent observers run on the background thread of the handler's
/// [`ConcurrencyManager`](crate::ConcurrencyManager), all others run on the
/// driver thread.
pub trait FixedObserver: Send + Sync {
    /// Runs this observer for a fixed tick that lasted `delta`.
    fn fixed_update(&self, delta: Duration);

    /// Whether this observer runs on the background thread. This must not
    /// change while the observer is registered.
    fn is_concurrent(&self) -> bool {
        false
    }

    /// Returns the lookup key of this observer.
    fn kind(&self) -> ObserverKind {
        ObserverKind::ANONYMOUS
    }

    /// Releases the resources held by this observer. This is never called by
    /// the handler itself.
    fn dispose(&self) {}
}
