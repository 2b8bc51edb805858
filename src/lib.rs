// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod error;
mod handler;
mod macros;
mod observer;

pub use crate::core::{
    Child, ChildState, ConcurrencyManager, ConcurrencyManagerBuilder, CpuPinningPolicy,
};
pub use error::{BoxError, ChildFault, HandoffError, TaskResult};
pub use handler::{UpdateHandler, UpdateHandlerBuilder};
pub use observer::{FixedObserver, Observer, ObserverKind};
