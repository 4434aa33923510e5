#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Multithreaded benchmark harness that runs a workload against shared fixtures on a pool of
//! worker threads, separating warmup from measurement and reporting throughput or latency
//! statistics.
//!
//! The harness coordinates a group of threads executing the same benchmark:
//!
//! * Every benchmark operates on a [`Fixture`], shared state that is constructed exactly once per
//!   trial by whichever thread needs it first and torn down exactly once after the last
//!   iteration. The [`LifecycleManager`] guarantees this with a double-checked construction
//!   section and a compare-and-swap [`PhaseMutex`] per lifecycle action.
//! * Every iteration moves each thread through the phases of a [`PhaseController`]: acquiring
//!   fixtures, warming up, measuring, warming down and, on the last iteration, tearing down.
//! * The measurement itself is done by one of four [`Measurement`] strategies:
//!   [`Throughput`], [`AverageTime`], [`SampleTime`] and [`SingleShotTime`].
//! * Raw counters are normalized by batch size and operations per invocation into an
//!   [`IterationResult`].
//!
//! A failure on any thread is sticky for the whole trial: every thread waiting on another one
//! gives up with [`Error::Aborted`] instead of retrying, and no partial result is reported.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! use new_zealand::nz;
//! use parking_lot::Mutex;
//! use trial_bench::{BoxedError, Fixture, FixtureRegistry, Mode, Params, Trial, WorkerPool};
//!
//! #[derive(Debug)]
//! struct Store {
//!     entries: Mutex<HashMap<u64, u64>>,
//! }
//!
//! impl Fixture for Store {
//!     fn from_params(params: &Params) -> Result<Self, BoxedError> {
//!         let capacity: usize = params.get("capacity")?;
//!
//!         Ok(Self {
//!             entries: Mutex::new(HashMap::with_capacity(capacity)),
//!         })
//!     }
//! }
//!
//! let trial = Trial::builder("put", "store")
//!     .mode(Mode::AverageTime)
//!     .params(Params::new().with("capacity", "1024"))
//!     .measurement_iterations(nz!(2))
//!     .iteration_duration(Duration::from_millis(10))
//!     .build();
//!
//! let mut pool = WorkerPool::unpinned(nz!(2));
//! let registry = FixtureRegistry::new();
//!
//! let summary = trial
//!     .execute_on(&mut pool, &registry, |store: &Store| {
//!         store.entries.lock().insert(1, 2);
//!     })
//!     .unwrap();
//!
//! println!("put: {:.1} s/op", summary.aggregate_score());
//! ```

mod backoff;
mod control;
mod error;
mod fixture;
mod lifecycle;
mod measure;
mod params;
mod phase;
mod phase_mutex;
mod registry;
mod result;
mod sample_buffer;
mod threadpool;
mod trial;

pub use backoff::*;
pub use control::*;
pub use error::*;
pub use fixture::*;
pub use lifecycle::*;
pub use measure::*;
pub use params::*;
pub use phase::*;
pub use phase_mutex::*;
pub use registry::*;
pub use result::*;
pub use sample_buffer::*;
pub use threadpool::*;
pub use trial::*;
