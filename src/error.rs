// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types of the handoff protocol.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// A type-erased error returned by a concurrent task.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of running one pass of a concurrent task.
pub type TaskResult = Result<(), BoxError>;

/// Errors reported when starting a
/// [`ConcurrencyManager`](crate::ConcurrencyManager).
#[derive(Error, Debug)]
pub enum HandoffError {
    /// A background thread already exists for this manager.
    #[error("a background thread already exists")]
    AlreadyStarted,

    /// The operating system refused to spawn the background thread.
    #[error("failed to spawn the background thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The background thread didn't become live before the startup deadline.
    #[error("the background thread didn't start within {0:?}")]
    Unresponsive(Duration),

    /// The background thread couldn't be pinned to a CPU.
    #[error("CPU pinning failed: {0}")]
    CpuPinning(String),
}

/// A fault captured from the concurrent task on the background thread.
#[derive(Error, Debug)]
pub enum ChildFault {
    /// The task panicked.
    #[error("concurrent task panicked: {message}")]
    Panicked {
        /// Message carried by the panic payload, if it was a string.
        message: String,
    },

    /// The task returned an error.
    #[error("concurrent task failed: {source}")]
    Failed {
        /// Error returned by the task.
        #[source]
        source: BoxError,
    },
}

impl ChildFault {
    /// Captures a panic payload obtained from
    /// [`std::panic::catch_unwind()`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "<non-string panic payload>".to_owned(),
            },
        };
        ChildFault::Panicked { message }
    }
}
