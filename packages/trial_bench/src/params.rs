use std::collections::BTreeMap;
use std::num::NonZero;
use std::str::FromStr;
use std::time::Duration;

use new_zealand::nz;

use crate::{Error, Result};

/// Named configuration values applied to fixtures when they are constructed.
///
/// The values are kept as strings, the way they arrive from whatever supplies them, and are
/// parsed on demand by the fixture that needs them.
///
/// # Examples
///
/// ```
/// use trial_bench::Params;
///
/// let params = Params::new().with("key_count", "1000").with("value_size", "64");
///
/// let key_count: usize = params.get("key_count").unwrap();
/// assert_eq!(key_count, 1000);
/// assert!(params.get::<usize>("missing").is_err());
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the parameter set with one more value assigned.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Assigns a value, replacing any previous value of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Returns the raw string value of a parameter, if present.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Parses a parameter into the requested type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingParam`] if no value with this name was supplied and
    /// [`Error::InvalidParam`] if the value does not parse.
    pub fn get<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.raw(name).ok_or_else(|| Error::MissingParam {
            name: name.to_string(),
        })?;

        value.parse().map_err(|e: T::Err| Error::InvalidParam {
            name: name.to_string(),
            value: value.to_string(),
            problem: e.to_string(),
        })
    }

    /// Iterates over all parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of parameters in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set contains no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The measurement mode of a benchmark.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum Mode {
    /// Operations per unit of time.
    #[display("thrpt")]
    Throughput,

    /// Time per operation.
    #[display("avgt")]
    AverageTime,

    /// Sampled distribution of time per operation.
    #[display("sample")]
    SampleTime,

    /// Time of one batch, without a measurement window.
    #[display("ss")]
    SingleShotTime,
}

/// Unit in which time-based results are reported.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum TimeUnit {
    /// Nanoseconds.
    #[display("ns")]
    Nanoseconds,

    /// Microseconds.
    #[display("us")]
    Microseconds,

    /// Milliseconds.
    #[display("ms")]
    Milliseconds,

    /// Seconds.
    #[default]
    #[display("s")]
    Seconds,
}

impl TimeUnit {
    /// Number of nanoseconds in one unit.
    #[must_use]
    pub fn nanos_per_unit(self) -> f64 {
        match self {
            Self::Nanoseconds => 1.0,
            Self::Microseconds => 1_000.0,
            Self::Milliseconds => 1_000_000.0,
            Self::Seconds => 1_000_000_000.0,
        }
    }

    /// Expresses a duration in this unit.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "reported results are floating point, precision loss past 2^52 ns is acceptable"
    )]
    pub fn convert(self, duration: Duration) -> f64 {
        duration.as_nanos() as f64 / self.nanos_per_unit()
    }

    /// Expresses a raw nanosecond count in this unit.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "reported results are floating point, precision loss past 2^52 ns is acceptable"
    )]
    pub fn convert_nanos(self, nanos: u64) -> f64 {
        nanos as f64 / self.nanos_per_unit()
    }
}

/// Parameters that stay constant for the whole benchmark.
#[derive(Clone, Debug)]
pub struct BenchmarkParams {
    label: String,
    mode: Mode,
    ops_per_invocation: NonZero<u64>,
    time_unit: TimeUnit,
    params: Params,
}

impl BenchmarkParams {
    /// Creates benchmark parameters with one operation per invocation and no named parameters.
    #[must_use]
    pub fn new(label: impl Into<String>, mode: Mode) -> Self {
        Self {
            label: label.into(),
            mode,
            ops_per_invocation: nz!(1),
            time_unit: TimeUnit::default(),
            params: Params::new(),
        }
    }

    /// Sets how many logical operations one workload invocation represents.
    #[must_use]
    pub fn with_ops_per_invocation(mut self, ops_per_invocation: NonZero<u64>) -> Self {
        self.ops_per_invocation = ops_per_invocation;
        self
    }

    /// Sets the unit in which results are reported.
    #[must_use]
    pub fn with_time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Sets the named parameters applied to fixtures on construction.
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// The label under which results are reported.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The measurement mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// How many logical operations one workload invocation represents.
    #[must_use]
    pub fn ops_per_invocation(&self) -> NonZero<u64> {
        self.ops_per_invocation
    }

    /// The unit in which results are reported.
    #[must_use]
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// The named parameters applied to fixtures on construction.
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }
}

/// Parameters of one iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IterationParams {
    batch_size: NonZero<u64>,
    duration: Duration,
}

impl IterationParams {
    /// Creates iteration parameters.
    #[must_use]
    pub fn new(batch_size: NonZero<u64>, duration: Duration) -> Self {
        Self {
            batch_size,
            duration,
        }
    }

    /// Number of workload invocations grouped into one batch.
    #[must_use]
    pub fn batch_size(&self) -> NonZero<u64> {
        self.batch_size
    }

    /// Requested length of the measurement window.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Identity of the calling thread within the benchmark thread group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadParams {
    thread_index: usize,
    thread_count: NonZero<usize>,
    subgroup_index: usize,
}

impl ThreadParams {
    /// Creates thread parameters.
    #[must_use]
    pub fn new(thread_index: usize, thread_count: NonZero<usize>, subgroup_index: usize) -> Self {
        Self {
            thread_index,
            thread_count,
            subgroup_index,
        }
    }

    /// Index of the thread among all threads of the benchmark.
    #[must_use]
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Total number of threads executing the benchmark.
    #[must_use]
    pub fn thread_count(&self) -> NonZero<usize> {
        self.thread_count
    }

    /// Index of the subgroup the thread was assigned to.
    #[must_use]
    pub fn subgroup_index(&self) -> usize {
        self.subgroup_index
    }
}
