//! Runs the same key-value store workload in every measurement mode and prints the results.
//!
//! The store is a shared fixture: it is constructed once per trial from the `capacity`
//! parameter, prefilled in its setup hook and checked for consistency in its cleanup hook.
//! Raise the level of the subscriber below to `DEBUG` to see the lifecycle transitions logged
//! by the harness.

#![allow(missing_docs, reason = "No need for API documentation in example code")]

use std::collections::HashMap;
use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use new_zealand::nz;
use parking_lot::RwLock;
use trial_bench::{
    BackoffPolicy, BoxedError, Fixture, FixtureRegistry, Mode, Params, TimeUnit, Trial,
    WorkerPool,
};

#[derive(Debug)]
struct Store {
    capacity: NonZero<u64>,
    entries: RwLock<HashMap<u64, u64>>,
    next_key: AtomicU64,
}

impl Fixture for Store {
    fn from_params(params: &Params) -> Result<Self, BoxedError> {
        let capacity: NonZero<u64> = params.get("capacity")?;

        Ok(Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            next_key: AtomicU64::new(0),
        })
    }

    fn setup(&mut self) -> Result<(), BoxedError> {
        let entries = self.entries.get_mut();

        for key in 0..self.capacity.get() {
            entries.insert(key, key);
        }

        Ok(())
    }

    fn setup_iteration(&self) -> Result<(), BoxedError> {
        self.next_key.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn cleanup(&self) -> Result<(), BoxedError> {
        let entries = self.entries.read();

        if u64::try_from(entries.len())? != self.capacity.get() {
            return Err(format!(
                "store grew to {} entries, expected {}",
                entries.len(),
                self.capacity
            )
            .into());
        }

        Ok(())
    }
}

fn put(store: &Store) {
    // Overwrites keep the store at its configured capacity.
    let key = store
        .next_key
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_rem(store.capacity.get());
    store.entries.write().insert(key, key);
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut pool = WorkerPool::unpinned(nz!(4));
    let registry = FixtureRegistry::new();

    println!("trial_bench measurement modes");
    println!("=============================");
    println!();
    println!(
        "Running a key-value put workload on {} threads",
        pool.thread_count()
    );
    println!();

    for (mode, unit) in [
        (Mode::Throughput, TimeUnit::Seconds),
        (Mode::AverageTime, TimeUnit::Nanoseconds),
        (Mode::SampleTime, TimeUnit::Nanoseconds),
        (Mode::SingleShotTime, TimeUnit::Microseconds),
    ] {
        let trial = Trial::builder(format!("put/{mode}"), "store")
            .mode(mode)
            .time_unit(unit)
            .params(Params::new().with("capacity", "4096"))
            .warmup_iterations(1)
            .measurement_iterations(nz!(3))
            .iteration_duration(Duration::from_millis(200))
            // The default schedule jumps to a one second sleep, too coarse for short windows.
            .backoff(BackoffPolicy::exponential(
                Duration::from_micros(100),
                Duration::from_millis(10),
            ))
            .build();

        match trial.execute_on(&mut pool, &registry, put) {
            Ok(summary) => {
                for (index, score) in summary.iteration_scores().iter().enumerate() {
                    println!("{} iteration {index}: {score:.3}", summary.label());
                }

                println!(
                    "{} aggregate: {:.3} over {} operations",
                    summary.label(),
                    summary.aggregate_score(),
                    summary.measured_ops()
                );

                if mode == Mode::SampleTime {
                    let samples = summary.merged_samples();
                    println!("{} samples: {}", summary.label(), samples.len());
                }
            }
            Err(error) => println!("{} failed: {error}", trial.benchmark_params().label()),
        }

        println!();
    }
}
