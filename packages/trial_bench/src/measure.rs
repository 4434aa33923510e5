//! Measurement strategies.
//!
//! Every strategy drives the workload loop of the measurement window and accumulates a
//! [`RawResult`]. Turning the raw counters into a reported statistic is a separate step
//! ([`Measurement::metric()`]) that runs after operation counts have been normalized.

use std::time::{Duration, Instant};

use num_integer::Integer;

use crate::{Control, Metric, Mode, SampleBuffer, TimeUnit};

/// Linear congruential generator constants, as in Numerical Recipes.
const LCG_MULTIPLIER: u32 = 1_664_525;
const LCG_INCREMENT: u32 = 1_013_904_223;

/// Counters accumulated by one thread during one iteration.
#[derive(Clone, Debug, Default)]
pub struct RawResult {
    all_ops: u64,
    measured_ops: u64,
    start: Option<Instant>,
    stop: Option<Instant>,
    samples: SampleBuffer,
    spoiled: bool,
}

impl RawResult {
    /// Operations executed outside the measurement window (warmup and warmdown invocations).
    #[must_use]
    pub fn all_ops(&self) -> u64 {
        self.all_ops
    }

    /// Operations completed inside the measurement window, in the unit the strategy counts
    /// (invocations or batches).
    #[must_use]
    pub fn measured_ops(&self) -> u64 {
        self.measured_ops
    }

    /// Length of the measurement window, or zero if it never closed.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Latency samples recorded by sample time measurement.
    #[must_use]
    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    /// Whether measurement was abandoned because the volatile spoiler was raised.
    #[must_use]
    pub fn is_spoiled(&self) -> bool {
        self.spoiled
    }

    pub(crate) fn add_all_ops(&mut self, ops: u64) {
        self.all_ops = self.all_ops.saturating_add(ops);
    }
}

/// A way of measuring a workload during one iteration.
///
/// All strategies share the same contract: they invoke the workload until the control signals
/// that the window is over, they stop immediately without counting the batch in progress once
/// the volatile spoiler is raised, and they leave everything outside the window (warmup,
/// warmdown, lifecycle) to the caller.
pub trait Measurement: Send + Sync {
    /// The mode this strategy implements.
    fn mode(&self) -> Mode;

    /// Whether the iteration runs warmup and warmdown loops around the measurement window.
    fn has_warm_phases(&self) -> bool {
        true
    }

    /// Runs the measured loop.
    fn measure<F, W>(&self, workload: &W, fixture: &F, control: &Control) -> RawResult
    where
        F: ?Sized,
        W: Fn(&F) + ?Sized;

    /// Builds the reported statistic from a finished measurement and its normalized measured
    /// operation count.
    fn metric(&self, raw: RawResult, measured_ops: u64, unit: TimeUnit) -> Metric;
}

/// Counts workload invocations completed in the measurement window.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct Throughput;

impl Measurement for Throughput {
    fn mode(&self) -> Mode {
        Mode::Throughput
    }

    fn measure<F, W>(&self, workload: &W, fixture: &F, control: &Control) -> RawResult
    where
        F: ?Sized,
        W: Fn(&F) + ?Sized,
    {
        timed_loop(workload, fixture, control)
    }

    fn metric(&self, raw: RawResult, measured_ops: u64, unit: TimeUnit) -> Metric {
        Metric::Throughput {
            ops: measured_ops,
            elapsed: raw.elapsed(),
            unit,
        }
    }
}

/// Same loop as [`Throughput`], reported as time per operation.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct AverageTime;

impl Measurement for AverageTime {
    fn mode(&self) -> Mode {
        Mode::AverageTime
    }

    fn measure<F, W>(&self, workload: &W, fixture: &F, control: &Control) -> RawResult
    where
        F: ?Sized,
        W: Fn(&F) + ?Sized,
    {
        timed_loop(workload, fixture, control)
    }

    fn metric(&self, raw: RawResult, measured_ops: u64, unit: TimeUnit) -> Metric {
        Metric::AverageTime {
            ops: measured_ops,
            elapsed: raw.elapsed(),
            unit,
        }
    }
}

/// Records the latency of randomly chosen batches into a self-thinning [`SampleBuffer`].
///
/// Whether a batch is timed is decided by a linear congruential generator seeded from the
/// monotonic clock: a batch is timed when the bits of the generator selected by the sampling
/// mask are all zero. The mask starts at [`Control::rnd_mask()`], so the first iteration of a
/// trial (mask 0) times every batch.
///
/// Once as many samples have been recorded since the last thinning as the control allows per
/// iteration ([`Control::target_samples()`]), the buffer is halved and the mask widened by one
/// bit, which halves the sampling rate. The buffer therefore never holds more than twice the
/// target, however long the measurement window is. The widest mask reached is published back to
/// the control so that later iterations can start from it.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct SampleTime;

impl Measurement for SampleTime {
    fn mode(&self) -> Mode {
        Mode::SampleTime
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "only the low bits of the clock are needed as a seed"
    )]
    fn measure<F, W>(&self, workload: &W, fixture: &F, control: &Control) -> RawResult
    where
        F: ?Sized,
        W: Fn(&F) + ?Sized,
    {
        let batch_size = control.iteration_params().batch_size().get();
        let ops_per_invocation = control.benchmark_params().ops_per_invocation().get();

        let mut reservoir = Reservoir::new(control.target_samples(), control.rnd_mask());
        let mut rnd = control.clock_nanos() as u32;
        let mut batches: u64 = 0;
        let mut spoiled = false;

        let start = Instant::now();

        'measure: loop {
            rnd = rnd.wrapping_mul(LCG_MULTIPLIER).wrapping_add(LCG_INCREMENT);
            let batch_start = reservoir.should_sample(rnd).then(Instant::now);

            for _ in 0..batch_size {
                if control.volatile_spoiler() {
                    spoiled = true;
                    break 'measure;
                }

                workload(fixture);
            }

            if let Some(batch_start) = batch_start {
                let nanos = duration_nanos(batch_start.elapsed());
                reservoir.record(Integer::div_floor(&nanos, &ops_per_invocation));
            }

            batches = batches.saturating_add(1);

            if control.is_done() {
                break;
            }
        }

        let stop = Instant::now();

        control.publish_rnd_mask(reservoir.mask);

        RawResult {
            all_ops: 0,
            measured_ops: batches,
            start: Some(start),
            stop: Some(stop),
            samples: reservoir.samples,
            spoiled,
        }
    }

    fn metric(&self, raw: RawResult, _measured_ops: u64, unit: TimeUnit) -> Metric {
        Metric::SampleTime {
            samples: raw.samples,
            unit,
        }
    }
}

/// Times exactly one batch, without warmup or warmdown.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct SingleShotTime;

impl Measurement for SingleShotTime {
    fn mode(&self) -> Mode {
        Mode::SingleShotTime
    }

    fn has_warm_phases(&self) -> bool {
        false
    }

    fn measure<F, W>(&self, workload: &W, fixture: &F, control: &Control) -> RawResult
    where
        F: ?Sized,
        W: Fn(&F) + ?Sized,
    {
        let batch_size = control.iteration_params().batch_size().get();
        let mut spoiled = false;

        let start = Instant::now();

        for _ in 0..batch_size {
            if control.volatile_spoiler() {
                spoiled = true;
                break;
            }

            workload(fixture);
        }

        let stop = Instant::now();

        RawResult {
            all_ops: 0,
            measured_ops: u64::from(!spoiled),
            start: Some(start),
            stop: Some(stop),
            samples: SampleBuffer::new(),
            spoiled,
        }
    }

    fn metric(&self, raw: RawResult, _measured_ops: u64, unit: TimeUnit) -> Metric {
        Metric::SingleShot {
            elapsed: raw.elapsed(),
            unit,
        }
    }
}

/// The loop shared by throughput and average time: one invocation per counted operation until
/// the window closes.
fn timed_loop<F, W>(workload: &W, fixture: &F, control: &Control) -> RawResult
where
    F: ?Sized,
    W: Fn(&F) + ?Sized,
{
    let mut operations: u64 = 0;
    let mut spoiled = false;

    let start = Instant::now();

    loop {
        if control.volatile_spoiler() {
            spoiled = true;
            break;
        }

        workload(fixture);
        operations = operations.saturating_add(1);

        if control.is_done() {
            break;
        }
    }

    let stop = Instant::now();

    RawResult {
        all_ops: 0,
        measured_ops: operations,
        start: Some(start),
        stop: Some(stop),
        samples: SampleBuffer::new(),
        spoiled,
    }
}

/// Sampling state of [`SampleTime`]: the buffer, the mask that decides which batches are timed
/// and the number of samples recorded since the last thinning.
#[derive(Debug)]
struct Reservoir {
    samples: SampleBuffer,
    mask: u32,
    stride: u64,
    target: u64,
}

impl Reservoir {
    fn new(target: u64, mask: u32) -> Self {
        Self {
            samples: SampleBuffer::new(),
            mask,
            stride: 0,
            target: target.max(1),
        }
    }

    fn should_sample(&self, rnd: u32) -> bool {
        rnd & self.mask == 0
    }

    fn record(&mut self, sample: u64) {
        self.samples.add(sample);
        self.stride = self.stride.saturating_add(1);

        // Thinning on reaching the target rather than on exceeding it keeps the buffer at or
        // below twice the target between halvings.
        if self.stride >= self.target {
            self.samples.half();
            self.stride = 0;
            self.mask = self.mask.wrapping_shl(1) | 1;
        }
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::sync::atomic::{AtomicU64, Ordering};

    use new_zealand::nz;

    use super::*;
    use crate::{BenchmarkParams, IterationParams};

    fn control(mode: Mode, batch_size: u64, duration: Duration) -> Control {
        Control::new(
            BenchmarkParams::new("measure", mode),
            IterationParams::new(NonZeroU64::new(batch_size).unwrap(), duration),
            nz!(1),
        )
    }

    #[test]
    fn reservoir_never_exceeds_twice_target() {
        let mut reservoir = Reservoir::new(16, 0);
        let mut largest = 0;

        for sample in 0..10_000 {
            reservoir.record(sample);
            largest = largest.max(reservoir.samples.len());
        }

        assert!(largest <= 32, "buffer grew to {largest}");
        assert!(reservoir.mask > 0);
    }

    #[test]
    fn reservoir_widens_mask_by_one_bit_per_thinning() {
        let mut reservoir = Reservoir::new(2, 0);

        for sample in 0..6 {
            reservoir.record(sample);
        }

        assert_eq!(reservoir.mask, 0b111);
        assert!(!reservoir.should_sample(0b001));
        assert!(reservoir.should_sample(0b1000));
    }

    #[test]
    fn zero_mask_samples_every_batch() {
        let reservoir = Reservoir::new(1, 0);

        assert!(reservoir.should_sample(0));
        assert!(reservoir.should_sample(u32::MAX));
    }

    #[test]
    fn throughput_stops_when_done() {
        let control = control(Mode::Throughput, 1, Duration::from_millis(10));
        let calls = AtomicU64::new(0);

        let raw = Throughput.measure(
            &|calls: &AtomicU64| {
                if calls.fetch_add(1, Ordering::Relaxed) == 99 {
                    control.set_done();
                }
            },
            &calls,
            &control,
        );

        assert_eq!(raw.measured_ops(), 100);
        assert_eq!(calls.load(Ordering::Relaxed), 100);
        assert!(!raw.is_spoiled());
    }

    #[test]
    fn average_time_stops_at_spoiler() {
        let control = control(Mode::Throughput, 1, Duration::from_millis(10));
        let calls = AtomicU64::new(0);

        let raw = AverageTime.measure(
            &|calls: &AtomicU64| {
                if calls.fetch_add(1, Ordering::Relaxed) == 9 {
                    control.spoil();
                }
            },
            &calls,
            &control,
        );

        assert_eq!(raw.measured_ops(), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 10);
        assert!(raw.is_spoiled());
    }

    #[test]
    fn sample_time_records_every_batch_with_zero_mask() {
        let control = control(Mode::SampleTime, 4, Duration::from_secs(1));
        let calls = AtomicU64::new(0);

        let raw = SampleTime.measure(
            &|calls: &AtomicU64| {
                if calls.fetch_add(1, Ordering::Relaxed) == 19 {
                    control.set_done();
                }
            },
            &calls,
            &control,
        );

        assert_eq!(raw.measured_ops(), 5);
        assert_eq!(raw.samples().len(), 5);
        assert_eq!(control.rnd_mask(), 0);
    }

    #[test]
    fn sample_time_spoiled_mid_batch_records_nothing() {
        let control = control(Mode::SampleTime, 10, Duration::from_secs(1));
        let calls = AtomicU64::new(0);

        let raw = SampleTime.measure(
            &|calls: &AtomicU64| {
                if calls.fetch_add(1, Ordering::Relaxed) == 2 {
                    control.spoil();
                }
            },
            &calls,
            &control,
        );

        // The spoiler is observed before the fourth invocation of the first batch.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(raw.measured_ops(), 0);
        assert!(raw.samples().is_empty());
        assert!(raw.is_spoiled());
    }

    #[test]
    fn single_shot_runs_one_batch() {
        let control = control(Mode::SingleShotTime, 3, Duration::from_secs(1));
        let calls = AtomicU64::new(0);

        let raw = SingleShotTime.measure(
            &|calls: &AtomicU64| {
                calls.fetch_add(1, Ordering::Relaxed);
            },
            &calls,
            &control,
        );

        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(raw.measured_ops(), 1);
        assert!(!SingleShotTime.has_warm_phases());
    }

    #[test]
    fn single_shot_ignores_done() {
        let control = control(Mode::SingleShotTime, 2, Duration::from_secs(1));
        control.set_done();
        let calls = AtomicU64::new(0);

        SingleShotTime.measure(
            &|calls: &AtomicU64| {
                calls.fetch_add(1, Ordering::Relaxed);
            },
            &calls,
            &control,
        );

        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
