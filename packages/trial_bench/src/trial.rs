use std::num::NonZero;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use new_zealand::nz;
use num_integer::Integer;
use tracing::{debug, warn};

use crate::{
    BackoffPolicy, BenchmarkParams, Control, Error, Fixture, FixtureRegistry, FixtureSlot,
    IterationParams, IterationResult, LifecycleManager, Metric, Mode, Params, Result, SampleBuffer,
    ThreadParams, TimeUnit, WorkerPool, run_average_time, run_sample_time, run_single_shot,
    run_throughput,
};

/// How often the trial driver polls the thread group while waiting for it.
const DRIVER_POLL: BackoffPolicy =
    BackoffPolicy::exponential(Duration::from_micros(100), Duration::from_millis(1));

/// Longest single sleep of the driver while the measurement window is open, bounding how late it
/// notices a failing trial.
const WINDOW_SLICE: Duration = Duration::from_millis(5);

/// A configured benchmark: which fixture and workload to measure, how, and for how long.
///
/// A trial constructs its fixture once, runs the warmup iterations followed by the measurement
/// iterations on every thread of a [`WorkerPool`], and tears the fixture down after the last
/// iteration. Results of warmup iterations are discarded.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::time::Duration;
///
/// use new_zealand::nz;
/// use trial_bench::{BoxedError, Fixture, FixtureRegistry, Mode, Params, Trial, WorkerPool};
///
/// #[derive(Debug, Default)]
/// struct Counter(AtomicU64);
///
/// impl Fixture for Counter {
///     fn from_params(_: &Params) -> Result<Self, BoxedError> {
///         Ok(Self::default())
///     }
/// }
///
/// let trial = Trial::builder("increment", "counter")
///     .mode(Mode::Throughput)
///     .warmup_iterations(0)
///     .measurement_iterations(nz!(2))
///     .iteration_duration(Duration::from_millis(10))
///     .build();
///
/// let mut pool = WorkerPool::unpinned(nz!(2));
/// let registry = FixtureRegistry::new();
///
/// let summary = trial
///     .execute_on(&mut pool, &registry, |counter: &Counter| {
///         counter.0.fetch_add(1, Ordering::Relaxed);
///     })
///     .unwrap();
///
/// assert_eq!(summary.iterations().len(), 2);
/// assert!(summary.aggregate_score() > 0.0);
/// ```
#[derive(Clone, Debug)]
pub struct Trial {
    fixture_name: &'static str,
    benchmark: BenchmarkParams,
    warmup_iterations: u32,
    measurement_iterations: NonZero<u32>,
    iteration: IterationParams,
    subgroups: NonZero<usize>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl Trial {
    /// Starts configuring a trial reported under `label` whose fixture lives in the slot named
    /// `fixture_name`.
    #[must_use]
    pub fn builder(label: impl Into<String>, fixture_name: &'static str) -> TrialBuilder {
        TrialBuilder::new(label.into(), fixture_name)
    }

    /// Parameters that stay constant for the whole benchmark.
    #[must_use]
    pub fn benchmark_params(&self) -> &BenchmarkParams {
        &self.benchmark
    }

    /// Parameters of every iteration.
    #[must_use]
    pub fn iteration_params(&self) -> &IterationParams {
        &self.iteration
    }

    /// Executes the trial on every thread of the pool.
    ///
    /// # Errors
    ///
    /// Returns the first failure reported by any thread, preferring the error that caused the
    /// trial to fail over [`Error::Aborted`] reported by the threads that merely observed it.
    /// [`Error::Interrupted`] is returned if an iteration exceeded its timeout, after the fixture
    /// has been cleaned up.
    ///
    /// # Panics
    ///
    /// Panics if the thread count of the pool is not divisible by the number of subgroups.
    /// A panic in the workload or a fixture hook fails the trial and is resumed on the caller.
    pub fn execute_on<F, W>(
        &self,
        pool: &mut WorkerPool,
        registry: &FixtureRegistry,
        workload: W,
    ) -> Result<TrialSummary>
    where
        F: Fixture,
        W: Fn(&F) + Send + Sync,
    {
        let thread_count = pool.thread_count();
        let (threads_per_subgroup, remainder) = thread_count.get().div_rem(&self.subgroups.get());

        assert!(
            remainder == 0,
            "worker pool thread count must be divisible by the number of subgroups"
        );

        let threads_per_subgroup = NonZero::new(threads_per_subgroup)
            .expect("guarded by NonZero thread count as well as remainder check above");

        let lifecycle = LifecycleManager::new(registry);
        let slot = lifecycle.slot::<F>(self.fixture_name);
        let failure_flag = Arc::new(AtomicBool::new(false));

        let total = self
            .warmup_iterations
            .saturating_add(self.measurement_iterations.get());

        let mut rnd_mask = 0;
        let mut summary = TrialSummary::new(self.benchmark.label(), self.benchmark.mode());

        for index in 0..total {
            let is_warmup = index < self.warmup_iterations;

            let control = Control::new(self.benchmark.clone(), self.iteration, thread_count)
                .with_failure_flag(Arc::clone(&failure_flag))
                .with_last_iteration(index.saturating_add(1) == total)
                .with_backoff(self.backoff)
                .with_start_rnd_mask(rnd_mask);

            debug!(
                benchmark = self.benchmark.label(),
                iteration = index,
                warmup = is_warmup,
                "starting iteration"
            );

            let results = self.run_iteration(
                pool,
                &lifecycle,
                &slot,
                &control,
                threads_per_subgroup,
                &workload,
            )?;

            rnd_mask = control.rnd_mask();

            if !is_warmup {
                summary.iterations.push(results);
            }
        }

        Ok(summary)
    }

    fn run_iteration<F, W>(
        &self,
        pool: &mut WorkerPool,
        lifecycle: &LifecycleManager<'_>,
        slot: &FixtureSlot<F>,
        control: &Control,
        threads_per_subgroup: NonZero<usize>,
        workload: &W,
    ) -> Result<Vec<IterationResult>>
    where
        F: Fixture,
        W: Fn(&F) + Send + Sync,
    {
        let thread_count = control.thread_count();
        let mode = self.benchmark.mode();

        let outcomes = thread::scope(|s| {
            s.spawn(|| self.drive(control, mode != Mode::SingleShotTime));

            pool.execute_task(|thread_index| {
                let thread = ThreadParams::new(
                    thread_index,
                    thread_count,
                    Integer::div_floor(&thread_index, &threads_per_subgroup.get()),
                );

                match mode {
                    Mode::Throughput => run_throughput(lifecycle, slot, control, thread, workload),
                    Mode::AverageTime => {
                        run_average_time(lifecycle, slot, control, thread, workload)
                    }
                    Mode::SampleTime => run_sample_time(lifecycle, slot, control, thread, workload),
                    Mode::SingleShotTime => {
                        run_single_shot(lifecycle, slot, control, thread, workload)
                    }
                }
            })
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failure: Option<Error> = None;

        for outcome in outcomes {
            match outcome {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(error)) => {
                    // Keep the error that made the trial fail, not the aborts it caused.
                    let replaces = failure
                        .as_ref()
                        .is_none_or(|current| current.is_secondary() && !error.is_secondary());

                    if replaces {
                        failure = Some(error);
                    }
                }
                Err(payload) => {
                    // The fixture is abandoned, so the next trial must construct a fresh one.
                    slot.clear();
                    panic::resume_unwind(payload);
                }
            }
        }

        let Some(mut error) = failure else {
            return Ok(results);
        };

        // Threads that gave up waiting on an interrupted iteration report it as an abort.
        if error.is_secondary() && control.is_interrupted() {
            error = Error::Interrupted;
        }

        // Only a failing trial abandons its fixture. An interrupted one still owns a healthy
        // fixture that has to be cleaned up, whichever iteration was interrupted.
        let cleanup = if control.is_failing() {
            Ok(())
        } else {
            lifecycle.release(slot, control)
        };

        if let Err(cleanup_error) = cleanup {
            error = cleanup_error;
        }

        warn!(benchmark = self.benchmark.label(), %error, "trial failed");
        slot.clear();

        Err(error)
    }

    /// Opens and closes the loops of one iteration from outside the thread group.
    #[cfg_attr(test, mutants::skip)] // Timing-dependent, mutations mostly cause hangs.
    fn drive(&self, control: &Control, warm_phases: bool) {
        if !warm_phases {
            control.release_warmup();
            control.set_done();
            control.release_warmdown();
            return;
        }

        let thread_count = control.thread_count().get();

        if control
            .wait_while(&DRIVER_POLL, || control.warmup_ready_count() < thread_count)
            .is_err()
        {
            control.release_all();
            return;
        }

        control.release_warmup();

        let window_end = Instant::now().checked_add(control.duration());

        while let Some(remaining) =
            window_end.and_then(|end| end.checked_duration_since(Instant::now()))
        {
            if remaining.is_zero() {
                break;
            }

            thread::sleep(remaining.min(WINDOW_SLICE));

            if control.is_failing() {
                control.release_all();
                return;
            }
        }

        control.set_done();

        let deadline = Instant::now().checked_add(self.timeout);

        let waited = control.wait_while(&DRIVER_POLL, || {
            control.warmdown_ready_count() < thread_count
                && deadline.is_none_or(|deadline| Instant::now() < deadline)
        });

        if waited.is_err() {
            control.release_all();
            return;
        }

        if control.warmdown_ready_count() < thread_count {
            warn!(
                benchmark = control.benchmark_params().label(),
                timeout = ?self.timeout,
                "iteration exceeded its timeout, interrupting"
            );
            control.interrupt();
            control.release_all();
            return;
        }

        control.release_warmdown();
    }
}

/// Builds a [`Trial`].
///
/// Defaults: throughput mode, 1 warmup iteration, 3 measurement iterations of 100 ms each,
/// batch size 1, 1 operation per invocation, results in seconds, a single subgroup, no
/// parameters, the default [`BackoffPolicy`] (see [`backoff()`][Self::backoff] for its cost) and
/// a 10 minute iteration timeout.
#[derive(Clone, Debug)]
#[must_use]
pub struct TrialBuilder {
    label: String,
    fixture_name: &'static str,
    mode: Mode,
    warmup_iterations: u32,
    measurement_iterations: NonZero<u32>,
    iteration_duration: Duration,
    batch_size: NonZero<u64>,
    ops_per_invocation: NonZero<u64>,
    time_unit: TimeUnit,
    subgroups: NonZero<usize>,
    params: Params,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl TrialBuilder {
    fn new(label: String, fixture_name: &'static str) -> Self {
        Self {
            label,
            fixture_name,
            mode: Mode::Throughput,
            warmup_iterations: 1,
            measurement_iterations: nz!(3),
            iteration_duration: Duration::from_millis(100),
            batch_size: nz!(1),
            ops_per_invocation: nz!(1),
            time_unit: TimeUnit::default(),
            subgroups: nz!(1),
            params: Params::new(),
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Sets the measurement mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets how many unreported iterations run before the measured ones.
    pub fn warmup_iterations(mut self, count: u32) -> Self {
        self.warmup_iterations = count;
        self
    }

    /// Sets how many measured iterations run.
    pub fn measurement_iterations(mut self, count: NonZero<u32>) -> Self {
        self.measurement_iterations = count;
        self
    }

    /// Sets the length of the measurement window of each iteration.
    pub fn iteration_duration(mut self, duration: Duration) -> Self {
        self.iteration_duration = duration;
        self
    }

    /// Sets how many workload invocations form one batch.
    pub fn batch_size(mut self, batch_size: NonZero<u64>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets how many logical operations one workload invocation represents.
    pub fn ops_per_invocation(mut self, ops: NonZero<u64>) -> Self {
        self.ops_per_invocation = ops;
        self
    }

    /// Sets the unit results are reported in.
    pub fn time_unit(mut self, unit: TimeUnit) -> Self {
        self.time_unit = unit;
        self
    }

    /// Sets into how many subgroups the threads of the pool are divided.
    ///
    /// Only subgroup 0 has a role in a benchmark, so more than one subgroup fails the trial with
    /// [`Error::GroupDistribution`].
    pub fn subgroups(mut self, subgroups: NonZero<usize>) -> Self {
        self.subgroups = subgroups;
        self
    }

    /// Sets the parameters applied to the fixture on construction.
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Sets the backoff followed by threads waiting for each other.
    ///
    /// The policy governs every wait of the iteration: the phase mutex losers of fixture hooks,
    /// the setup and teardown rendezvous and trial teardown. The default
    /// [`BackoffPolicy::default()`] sleeps 1 ms and then jumps to 1024 ms, so any hook or
    /// warmdown invocation that keeps other threads waiting for more than 1 ms costs each of
    /// them about a second per wait. Short iterations should use
    /// [`BackoffPolicy::exponential()`] with a small maximum.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how long the driver waits for the thread group after the measurement window closes
    /// before interrupting the iteration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the trial.
    #[must_use]
    pub fn build(self) -> Trial {
        Trial {
            fixture_name: self.fixture_name,
            benchmark: BenchmarkParams::new(self.label, self.mode)
                .with_ops_per_invocation(self.ops_per_invocation)
                .with_time_unit(self.time_unit)
                .with_params(self.params),
            warmup_iterations: self.warmup_iterations,
            measurement_iterations: self.measurement_iterations,
            iteration: IterationParams::new(self.batch_size, self.iteration_duration),
            subgroups: self.subgroups,
            backoff: self.backoff,
            timeout: self.timeout,
        }
    }
}

/// The results of every measured iteration of a trial, one [`IterationResult`] per thread.
#[derive(Clone, Debug)]
pub struct TrialSummary {
    label: String,
    mode: Mode,
    iterations: Vec<Vec<IterationResult>>,
}

impl TrialSummary {
    fn new(label: &str, mode: Mode) -> Self {
        Self {
            label: label.to_string(),
            mode,
            iterations: Vec::new(),
        }
    }

    /// The label the trial was reported under.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The measurement mode of the trial.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Per measured iteration, the results of every thread.
    #[must_use]
    pub fn iterations(&self) -> &[Vec<IterationResult>] {
        &self.iterations
    }

    /// The score of each measured iteration, combining the primary metric of all threads.
    ///
    /// Throughput adds up across threads, every other mode is averaged.
    #[must_use]
    pub fn iteration_scores(&self) -> Vec<f64> {
        self.iterations
            .iter()
            .map(|threads| {
                let scores = threads
                    .iter()
                    .filter_map(IterationResult::primary)
                    .map(|m| m.metric().score());

                match self.mode {
                    Mode::Throughput => scores.sum(),
                    _ => mean(scores),
                }
            })
            .collect()
    }

    /// The mean of the iteration scores, or `NaN` if there are none.
    #[must_use]
    pub fn aggregate_score(&self) -> f64 {
        mean(self.iteration_scores().into_iter())
    }

    /// Total normalized operations measured across all threads and iterations.
    #[must_use]
    pub fn measured_ops(&self) -> u64 {
        self.iterations
            .iter()
            .flatten()
            .fold(0_u64, |total, r| total.saturating_add(r.measured_ops()))
    }

    /// Every latency sample recorded by any thread in any measured iteration.
    #[must_use]
    pub fn merged_samples(&self) -> SampleBuffer {
        let mut merged = SampleBuffer::new();

        for result in self.iterations.iter().flatten() {
            for metric in result.metrics() {
                if let Metric::SampleTime { samples, .. } = metric.metric() {
                    merged.merge(samples);
                }
            }
        }

        merged
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "reported results are floating point"
)]
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0_u64), |(sum, count), value| {
        (sum + value, count.saturating_add(1))
    });

    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}
