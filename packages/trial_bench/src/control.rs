use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::{BackoffPolicy, BenchmarkParams, Error, IterationParams, Result};

/// Upper bound on samples recorded per millisecond of measurement in sample time mode.
pub const SAMPLES_PER_MILLISECOND: u64 = 20;

/// The signals shared by all threads executing one iteration of a benchmark.
///
/// A new `Control` is created for every iteration, except for the failure flag, which is shared
/// by every iteration of a trial via [`with_failure_flag()`][Self::with_failure_flag]. Once the
/// failure flag is set it is never cleared, and every thread waiting on any phase mutex or
/// rendezvous of the trial observes it and gives up with [`Error::Aborted`].
///
/// All waiting is done by sleeping with backoff and polling, never by blocking on a condition
/// variable.
#[derive(Debug)]
pub struct Control {
    benchmark: BenchmarkParams,
    iteration: IterationParams,
    thread_count: NonZero<usize>,
    last_iteration: bool,
    backoff: BackoffPolicy,
    epoch: Instant,

    is_failing: Arc<AtomicBool>,
    is_done: AtomicBool,
    volatile_spoiler: AtomicBool,
    interrupted: AtomicBool,

    start_measurement: AtomicBool,
    stop_measurement: AtomicBool,

    warmup_should_wait: AtomicBool,
    warmdown_should_wait: AtomicBool,
    warmup_ready: AtomicUsize,
    warmdown_ready: AtomicUsize,

    setup_arrivals: AtomicUsize,
    teardown_arrivals: AtomicUsize,
    forced_teardown: AtomicBool,

    rnd_mask: AtomicU32,
}

impl Control {
    /// Creates the control block for one iteration executed by `thread_count` threads.
    #[must_use]
    pub fn new(
        benchmark: BenchmarkParams,
        iteration: IterationParams,
        thread_count: NonZero<usize>,
    ) -> Self {
        Self {
            benchmark,
            iteration,
            thread_count,
            last_iteration: false,
            backoff: BackoffPolicy::default(),
            epoch: Instant::now(),
            is_failing: Arc::new(AtomicBool::new(false)),
            is_done: AtomicBool::new(false),
            volatile_spoiler: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            start_measurement: AtomicBool::new(false),
            stop_measurement: AtomicBool::new(false),
            warmup_should_wait: AtomicBool::new(true),
            warmdown_should_wait: AtomicBool::new(true),
            warmup_ready: AtomicUsize::new(0),
            warmdown_ready: AtomicUsize::new(0),
            setup_arrivals: AtomicUsize::new(0),
            teardown_arrivals: AtomicUsize::new(0),
            forced_teardown: AtomicBool::new(false),
            rnd_mask: AtomicU32::new(0),
        }
    }

    /// Shares the failure flag of an earlier iteration of the same trial.
    #[must_use]
    pub fn with_failure_flag(mut self, is_failing: Arc<AtomicBool>) -> Self {
        self.is_failing = is_failing;
        self
    }

    /// Marks this iteration as the last one of the trial, which triggers trial teardown.
    #[must_use]
    pub fn with_last_iteration(mut self, last_iteration: bool) -> Self {
        self.last_iteration = last_iteration;
        self
    }

    /// Sets the backoff followed by threads waiting on phase mutexes and rendezvous points.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the sampling mask that sample time measurement starts from.
    #[must_use]
    pub fn with_start_rnd_mask(self, mask: u32) -> Self {
        self.rnd_mask.store(mask, Ordering::Relaxed);
        self
    }

    /// Parameters that stay constant for the whole benchmark.
    #[must_use]
    pub fn benchmark_params(&self) -> &BenchmarkParams {
        &self.benchmark
    }

    /// Parameters of this iteration.
    #[must_use]
    pub fn iteration_params(&self) -> &IterationParams {
        &self.iteration
    }

    /// Number of threads executing this iteration.
    #[must_use]
    pub fn thread_count(&self) -> NonZero<usize> {
        self.thread_count
    }

    /// Whether this is the last iteration of the trial.
    #[must_use]
    pub fn is_last_iteration(&self) -> bool {
        self.last_iteration
    }

    /// The backoff followed by waiting threads.
    #[must_use]
    pub fn backoff_policy(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// The requested length of the measurement window.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.iteration.duration()
    }

    /// How many samples sample time measurement may record before thinning its buffer.
    #[must_use]
    pub fn target_samples(&self) -> u64 {
        let millis = u64::try_from(self.duration().as_millis()).unwrap_or(u64::MAX);
        millis.saturating_mul(SAMPLES_PER_MILLISECOND)
    }

    /// A reading of the monotonic clock, in nanoseconds since this control block was created.
    #[must_use]
    pub fn clock_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// The sampling mask that sample time measurement starts from.
    #[must_use]
    pub fn rnd_mask(&self) -> u32 {
        self.rnd_mask.load(Ordering::Relaxed)
    }

    /// Publishes the sampling mask reached by one thread. The widest mask wins.
    pub fn publish_rnd_mask(&self, mask: u32) {
        self.rnd_mask.fetch_max(mask, Ordering::Relaxed);
    }

    /// Whether the measurement window has elapsed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::Acquire)
    }

    /// Ends the measurement window.
    pub fn set_done(&self) {
        self.is_done.store(true, Ordering::Release);
    }

    /// Whether measurement must stop immediately, abandoning the batch in progress.
    #[must_use]
    pub fn volatile_spoiler(&self) -> bool {
        self.volatile_spoiler.load(Ordering::Acquire)
    }

    /// Makes every running measurement stop immediately.
    pub fn spoil(&self) {
        self.volatile_spoiler.store(true, Ordering::Release);
    }

    /// Whether any thread of the trial has failed.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.is_failing.load(Ordering::Acquire)
    }

    /// Records that a thread of the trial has failed. The flag is never cleared.
    pub fn mark_failing(&self) {
        if !self.is_failing.swap(true, Ordering::AcqRel) {
            warn!(
                benchmark = self.benchmark.label(),
                "trial is failing, all waiting threads will abort"
            );
        }
    }

    /// The failure flag shared by every iteration of the trial.
    #[must_use]
    pub fn failure_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_failing)
    }

    /// Interrupts every thread currently waiting on this iteration.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Whether the iteration was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Records that a thread has started its measured loop.
    pub fn mark_measurement_started(&self) {
        self.start_measurement.store(true, Ordering::Release);
    }

    /// Records that a thread has finished its measured loop.
    pub fn mark_measurement_stopped(&self) {
        self.stop_measurement.store(true, Ordering::Release);
    }

    /// Whether any thread has started its measured loop.
    #[must_use]
    pub fn measurement_started(&self) -> bool {
        self.start_measurement.load(Ordering::Acquire)
    }

    /// Whether any thread has finished its measured loop.
    #[must_use]
    pub fn measurement_stopped(&self) -> bool {
        self.stop_measurement.load(Ordering::Acquire)
    }

    /// Whether threads must keep running warmup invocations.
    #[must_use]
    pub fn warmup_should_wait(&self) -> bool {
        self.warmup_should_wait.load(Ordering::Acquire)
    }

    /// Lets threads leave the warmup loop.
    pub fn release_warmup(&self) {
        self.warmup_should_wait.store(false, Ordering::Release);
    }

    /// Whether threads must keep running warmdown invocations.
    #[must_use]
    pub fn warmdown_should_wait(&self) -> bool {
        self.warmdown_should_wait.load(Ordering::Acquire)
    }

    /// Lets threads leave the warmdown loop.
    pub fn release_warmdown(&self) {
        self.warmdown_should_wait.store(false, Ordering::Release);
    }

    /// Releases every loop and measurement so that all threads can reach their exit path.
    pub fn release_all(&self) {
        self.release_warmup();
        self.set_done();
        self.spoil();
        self.release_warmdown();
    }

    /// Announces that the calling thread has entered its warmup loop.
    pub fn announce_warmup_ready(&self) {
        self.warmup_ready.fetch_add(1, Ordering::AcqRel);
    }

    /// Announces that the calling thread has entered its warmdown loop.
    pub fn announce_warmdown_ready(&self) {
        self.warmdown_ready.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of threads that have entered their warmup loop.
    #[must_use]
    pub fn warmup_ready_count(&self) -> usize {
        self.warmup_ready.load(Ordering::Acquire)
    }

    /// Number of threads that have entered their warmdown loop.
    #[must_use]
    pub fn warmdown_ready_count(&self) -> usize {
        self.warmdown_ready.load(Ordering::Acquire)
    }

    /// Waits until every thread of the iteration has finished acquiring its fixtures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the trial is failing or the iteration was interrupted.
    pub fn pre_setup(&self) -> Result<()> {
        self.rendezvous(&self.setup_arrivals)
    }

    /// Waits until every thread of the iteration is ready to tear down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the trial is failing or the iteration was interrupted. After
    /// an interruption of a trial that is not failing, the caller should continue with
    /// [`pre_tear_down_force()`][Self::pre_tear_down_force].
    pub fn pre_tear_down(&self) -> Result<()> {
        self.rendezvous(&self.teardown_arrivals)
    }

    /// Registers arrival at the teardown rendezvous without waiting for the other threads.
    ///
    /// The interrupted wait has already counted the arrival, so this only records that the
    /// iteration took the forced teardown path.
    pub fn pre_tear_down_force(&self) {
        self.forced_teardown.store(true, Ordering::Release);
    }

    /// Whether any thread took the forced teardown path in this iteration.
    #[must_use]
    pub fn teardown_was_forced(&self) -> bool {
        self.forced_teardown.load(Ordering::Acquire)
    }

    fn rendezvous(&self, arrivals: &AtomicUsize) -> Result<()> {
        arrivals.fetch_add(1, Ordering::AcqRel);

        self.wait_while(&self.backoff, || {
            arrivals.load(Ordering::Acquire) < self.thread_count.get()
        })
    }

    /// Sleeps with backoff for as long as `condition` holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] as soon as the trial is observed failing or the iteration is
    /// observed interrupted.
    pub fn wait_while(
        &self,
        policy: &BackoffPolicy,
        mut condition: impl FnMut() -> bool,
    ) -> Result<()> {
        let mut backoff = policy.start();

        while condition() {
            backoff.snooze();

            if self.is_failing() {
                return Err(Error::Aborted);
            }

            if self.is_interrupted() {
                return Err(Error::Aborted);
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use new_zealand::nz;

        use crate::Mode;

        Self::new(
            BenchmarkParams::new("test", Mode::Throughput),
            IterationParams::new(nz!(1), Duration::from_millis(10)),
            nz!(1),
        )
        .with_backoff(BackoffPolicy::exponential(
            Duration::from_millis(1),
            Duration::from_millis(4),
        ))
    }
}
