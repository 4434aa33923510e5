/// An ordered collection of latency samples, in nanoseconds per operation.
///
/// The buffer itself does not limit its size. Sample time measurement keeps it bounded by
/// calling [`half()`][Self::half] whenever enough new samples have accumulated, while at the same
/// time halving the rate at which new samples are taken. This keeps the relative sampling density
/// uniform across the whole measurement window regardless of how long the window is.
///
/// # Examples
///
/// ```
/// use trial_bench::SampleBuffer;
///
/// let mut buffer = SampleBuffer::new();
/// for sample in [40, 10, 30, 20] {
///     buffer.add(sample);
/// }
///
/// assert_eq!(buffer.percentile(50.0), Some(20));
///
/// buffer.half();
/// assert_eq!(buffer.iter().collect::<Vec<_>>(), vec![40, 30]);
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<u64>,
}

impl SampleBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sample.
    pub fn add(&mut self, sample: u64) {
        self.samples.push(sample);
    }

    /// Discards every second sample, keeping those at even positions.
    ///
    /// Samples are recorded at random points in time, so keeping every other one preserves the
    /// shape of the distribution while freeing half of the memory.
    pub fn half(&mut self) {
        let mut position: usize = 0;

        self.samples.retain(|_| {
            let keep = position & 1 == 0;
            position = position.wrapping_add(1);
            keep
        });
    }

    /// Number of samples in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterates over the samples in recording order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    /// Appends all samples of another buffer, e.g. to combine the buffers of several threads.
    pub fn merge(&mut self, other: &Self) {
        self.samples.extend_from_slice(&other.samples);
    }

    /// Smallest sample, if any.
    #[must_use]
    pub fn min(&self) -> Option<u64> {
        self.samples.iter().copied().min()
    }

    /// Largest sample, if any.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        self.samples.iter().copied().max()
    }

    /// Arithmetic mean of the samples, if any.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "statistics are reported as floating point"
    )]
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }

        let sum: u128 = self.samples.iter().map(|s| u128::from(*s)).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    /// The sample at the given percentile (0 to 100), using the nearest-rank method.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "rank is clamped into the valid index range before conversion"
    )]
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let count = sorted.len() as f64;
        let rank = (percentile.clamp(0.0, 100.0) / 100.0 * count).ceil().max(1.0);
        let index = (rank as usize).saturating_sub(1).min(sorted.len().saturating_sub(1));

        sorted.get(index).copied()
    }
}
