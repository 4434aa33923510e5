use std::fmt;
use std::num::NonZero;
use std::time::Duration;

use num_integer::Integer;

use crate::{Control, Measurement, Mode, RawResult, SampleBuffer, TimeUnit};

/// Whether a result is the headline metric of a benchmark or additional information.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum ResultRole {
    /// The metric the benchmark is ranked by.
    #[display("primary")]
    Primary,

    /// Supplementary metric reported alongside the primary one.
    #[display("secondary")]
    Secondary,
}

/// The statistic produced by one measurement strategy.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Metric {
    /// Operations completed in a measurement window.
    Throughput {
        /// Normalized operation count.
        ops: u64,

        /// Length of the measurement window.
        elapsed: Duration,

        /// Unit the score is reported in.
        unit: TimeUnit,
    },

    /// Time spent per operation in a measurement window.
    AverageTime {
        /// Normalized operation count.
        ops: u64,

        /// Length of the measurement window.
        elapsed: Duration,

        /// Unit the score is reported in.
        unit: TimeUnit,
    },

    /// Sampled distribution of nanoseconds per operation.
    SampleTime {
        /// The recorded samples.
        samples: SampleBuffer,

        /// Unit the score is reported in.
        unit: TimeUnit,
    },

    /// Duration of a single batch.
    SingleShot {
        /// The measured interval.
        elapsed: Duration,

        /// Unit the score is reported in.
        unit: TimeUnit,
    },
}

impl Metric {
    /// The scalar value of the metric in its unit.
    ///
    /// * Throughput: operations per unit.
    /// * Average time: units per operation.
    /// * Sample time: the median sample.
    /// * Single shot: the measured interval.
    ///
    /// Returns `NaN` if the metric has nothing to report, such as an average over zero
    /// operations or a sample distribution without samples.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "reported results are floating point"
    )]
    pub fn score(&self) -> f64 {
        match self {
            Self::Throughput { ops, elapsed, unit } => {
                let window = unit.convert(*elapsed);

                if window > 0.0 {
                    *ops as f64 / window
                } else {
                    f64::NAN
                }
            }
            Self::AverageTime { ops, elapsed, unit } => {
                if *ops == 0 {
                    f64::NAN
                } else {
                    unit.convert(*elapsed) / *ops as f64
                }
            }
            Self::SampleTime { samples, unit } => samples
                .percentile(50.0)
                .map_or(f64::NAN, |median| unit.convert_nanos(median)),
            Self::SingleShot { elapsed, unit } => unit.convert(*elapsed),
        }
    }

    /// The measurement mode that produced this metric.
    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            Self::Throughput { .. } => Mode::Throughput,
            Self::AverageTime { .. } => Mode::AverageTime,
            Self::SampleTime { .. } => Mode::SampleTime,
            Self::SingleShot { .. } => Mode::SingleShotTime,
        }
    }

    /// The unit of [`score()`][Self::score], e.g. `ops/s` or `us/op`.
    #[must_use]
    pub fn unit_label(&self) -> String {
        match self {
            Self::Throughput { unit, .. } => format!("ops/{unit}"),
            Self::AverageTime { unit, .. } | Self::SampleTime { unit, .. } => {
                format!("{unit}/op")
            }
            Self::SingleShot { unit, .. } => unit.to_string(),
        }
    }
}

/// One labeled metric of an iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricResult {
    role: ResultRole,
    label: String,
    metric: Metric,
}

impl MetricResult {
    /// Creates a labeled metric.
    #[must_use]
    pub fn new(role: ResultRole, label: impl Into<String>, metric: Metric) -> Self {
        Self {
            role,
            label: label.into(),
            metric,
        }
    }

    /// Whether this is the primary or a secondary metric.
    #[must_use]
    pub fn role(&self) -> ResultRole {
        self.role
    }

    /// The label the metric is reported under.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The metric.
    #[must_use]
    pub fn metric(&self) -> &Metric {
        &self.metric
    }
}

impl fmt::Display for MetricResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {:.3} {}",
            self.label,
            self.metric.mode(),
            self.metric.score(),
            self.metric.unit_label()
        )
    }
}

/// What one thread reports for one iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationResult {
    all_ops: u64,
    measured_ops: u64,
    metrics: Vec<MetricResult>,
}

impl IterationResult {
    /// Creates an iteration result from already normalized operation counts.
    #[must_use]
    pub fn new(all_ops: u64, measured_ops: u64, metrics: Vec<MetricResult>) -> Self {
        Self {
            all_ops,
            measured_ops,
            metrics,
        }
    }

    /// Normalizes the raw counters of a measurement and wraps its metric as the primary result.
    #[must_use]
    pub fn from_raw<M: Measurement>(strategy: &M, raw: RawResult, control: &Control) -> Self {
        let benchmark = control.benchmark_params();

        let (all_ops, measured_ops) = normalize(
            strategy.mode(),
            raw.all_ops(),
            raw.measured_ops(),
            control.iteration_params().batch_size(),
            benchmark.ops_per_invocation(),
        );

        let metric = strategy.metric(raw, measured_ops, benchmark.time_unit());

        Self::new(
            all_ops,
            measured_ops,
            vec![MetricResult::new(
                ResultRole::Primary,
                benchmark.label(),
                metric,
            )],
        )
    }

    /// Returns the result with one more metric attached.
    #[must_use]
    pub fn with_metric(mut self, metric: MetricResult) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Normalized count of every operation executed, warmup and warmdown included.
    #[must_use]
    pub fn all_ops(&self) -> u64 {
        self.all_ops
    }

    /// Normalized count of the operations executed inside the measurement window.
    #[must_use]
    pub fn measured_ops(&self) -> u64 {
        self.measured_ops
    }

    /// All metrics of the iteration.
    #[must_use]
    pub fn metrics(&self) -> &[MetricResult] {
        &self.metrics
    }

    /// The primary metric, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&MetricResult> {
        self.metrics
            .iter()
            .find(|m| m.role() == ResultRole::Primary)
    }
}

/// Scales raw operation counts to logical operations, returning `(all_ops, measured_ops)`.
///
/// Throughput and average time count workload invocations, so both counters are multiplied by
/// `ops_per_invocation` and divided by `batch_size`. Sample time and single shot count batches,
/// so the measured count is first expanded to invocations for the total and only multiplied by
/// `ops_per_invocation` for the measured count.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use trial_bench::{Mode, normalize};
///
/// assert_eq!(normalize(Mode::Throughput, 0, 100, nz!(10), nz!(5)), (50, 50));
/// assert_eq!(normalize(Mode::SampleTime, 0, 100, nz!(10), nz!(5)), (500, 500));
/// ```
#[must_use]
pub fn normalize(
    mode: Mode,
    all_ops: u64,
    measured_ops: u64,
    batch_size: NonZero<u64>,
    ops_per_invocation: NonZero<u64>,
) -> (u64, u64) {
    let all_ops = u128::from(all_ops);
    let measured_ops = u128::from(measured_ops);
    let batch = u128::from(batch_size.get());
    let opi = u128::from(ops_per_invocation.get());

    match mode {
        Mode::SampleTime | Mode::SingleShotTime => (
            scale(
                all_ops.saturating_add(measured_ops.saturating_mul(batch)),
                opi,
                batch,
            ),
            saturate(measured_ops.saturating_mul(opi)),
        ),
        Mode::Throughput | Mode::AverageTime => (
            scale(all_ops.saturating_add(measured_ops), opi, batch),
            scale(measured_ops, opi, batch),
        ),
    }
}

fn scale(ops: u128, opi: u128, batch: u128) -> u64 {
    saturate(Integer::div_floor(&ops.saturating_mul(opi), &batch))
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
