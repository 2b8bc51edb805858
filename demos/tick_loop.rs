// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Simulated game loop driving an interpreter on the background thread.
//!
//! Run with `RUST_LOG=debug` to see the handshake lifecycle.

use clap::Parser;
use handoff::{
    Child, ConcurrencyManagerBuilder, CpuPinningPolicy, FixedObserver, Observer, ObserverKind,
    UpdateHandlerBuilder,
};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const INTERPRETER: ObserverKind = ObserverKind("interpreter");

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let handler = UpdateHandlerBuilder {
        handoff_timeout: Duration::from_millis(cli.handoff_timeout_ms),
        max_consecutive_timeouts: cli.max_consecutive_timeouts,
        manager: ConcurrencyManagerBuilder {
            thread_name: "interpreter".to_owned(),
            cpu_pinning: if cli.pin {
                CpuPinningPolicy::IfSupported
            } else {
                CpuPinningPolicy::No
            },
            ..Default::default()
        },
    }
    .build();

    let interpreter = Arc::new(Interpreter {
        work: cli.work,
        parallel_every: cli.parallel_every,
        fail_at: cli.fail_at,
        steps: AtomicU64::new(0),
    });
    let physics = Arc::new(Counter::default());
    let render = Arc::new(Counter::default());
    handler.add_fixed_observer(interpreter.clone());
    handler.add_fixed_observer(physics.clone());
    handler.add_observer(render.clone());

    let fixed_delta = Duration::from_secs(1) / cli.fixed_rate;
    let frame_delta = Duration::from_secs(1) / cli.frame_rate;
    let start = Instant::now();
    let mut accumulator = Duration::ZERO;
    for _ in 0..cli.frames {
        std::thread::sleep(frame_delta);
        accumulator += frame_delta;
        while accumulator >= fixed_delta {
            handler.update_fixed_observers(fixed_delta);
            accumulator -= fixed_delta;
        }
        handler.update_observers(frame_delta);
    }
    let elapsed = start.elapsed();

    println!("ran {} frames in {elapsed:?}", cli.frames);
    println!("simulated time = {:?}", handler.current_fixed_time());
    println!("physics steps = {}", physics.0.load(Ordering::Relaxed));
    println!("render frames = {}", render.0.load(Ordering::Relaxed));
    for observer in handler.fixed_observers_of_kind(INTERPRETER) {
        observer.dispose();
    }
    println!(
        "interpreter steps = {}",
        interpreter.steps.load(Ordering::Relaxed)
    );
    match handler.take_fault() {
        Some(fault) => println!("interpreter disabled: {fault}"),
        None => println!("interpreter running = {}", handler.is_concurrent_running()),
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of frames to simulate.
    #[arg(long, default_value_t = 120)]
    frames: u32,

    /// Frames per second.
    #[arg(long, default_value_t = 60)]
    frame_rate: u32,

    /// Fixed ticks per second.
    #[arg(long, default_value_t = 50)]
    fixed_rate: u32,

    /// Amount of busy work done by each interpreter step.
    #[arg(long, default_value_t = 100_000)]
    work: u64,

    /// Open a parallel window on every N-th interpreter step (0 to disable).
    #[arg(long, default_value_t = 4)]
    parallel_every: u64,

    /// Make the interpreter panic at the given step.
    #[arg(long)]
    fail_at: Option<u64>,

    /// Maximal time to wait for the interpreter on each fixed tick, in
    /// milliseconds.
    #[arg(long, default_value_t = 100)]
    handoff_timeout_ms: u64,

    /// Consecutive timeouts after which the interpreter is stopped.
    #[arg(long, default_value_t = 30)]
    max_consecutive_timeouts: usize,

    /// Pin the interpreter thread to a CPU.
    #[arg(long)]
    pin: bool,
}

/// Busy interpreter standing in for a script VM.
struct Interpreter {
    work: u64,
    parallel_every: u64,
    fail_at: Option<u64>,
    steps: AtomicU64,
}

impl Interpreter {
    fn spin(&self) {
        let mut x = 0u64;
        for i in 0..self.work {
            x = black_box(x.wrapping_mul(31).wrapping_add(i));
        }
        black_box(x);
    }
}

impl FixedObserver for Interpreter {
    fn fixed_update(&self, _delta: Duration) {
        let step = self.steps.fetch_add(1, Ordering::Relaxed);
        if self.fail_at == Some(step) {
            panic!("interpreter trapped at step {step}");
        }

        let child = Child::current();
        match child {
            Some(child) if self.parallel_every != 0 && step % self.parallel_every == 0 => {
                // Long computation that doesn't touch the game state.
                child.allow_parent_parallel();
                self.spin();
                self.spin();
                child.wait_for_parent();
                self.spin();
            }
            _ => self.spin(),
        }
    }

    fn is_concurrent(&self) -> bool {
        true
    }

    fn kind(&self) -> ObserverKind {
        INTERPRETER
    }

    fn dispose(&self) {
        log::info!("Interpreter disposed after {} steps", self.steps.load(Ordering::Relaxed));
    }
}

#[derive(Default)]
struct Counter(AtomicU64);

impl FixedObserver for Counter {
    fn fixed_update(&self, _delta: Duration) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

impl Observer for Counter {
    fn update(&self, _delta: Duration) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}
