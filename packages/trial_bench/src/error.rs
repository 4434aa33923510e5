use thiserror::Error;

use crate::PhaseKind;

/// Error type returned by fixture hooks and parameter parsing inside user code.
///
/// The harness never inspects these beyond carrying them as the source of its own [`Error`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while executing a benchmark iteration.
///
/// Once any thread of a trial observes [`Error::Setup`] or [`Error::Teardown`], the failure is
/// made visible to every other thread of the trial, which will then fail with
/// [`Error::Aborted`] instead of retrying. No iteration ever yields a partial result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Constructing a fixture or running one of its setup hooks failed.
    #[error("setup of fixture '{fixture}' failed during {phase}")]
    Setup {
        /// Name of the fixture whose setup failed.
        fixture: &'static str,

        /// The lifecycle phase that was being executed.
        phase: PhaseKind,

        /// The error reported by the fixture.
        #[source]
        source: BoxedError,
    },

    /// One of the teardown hooks of a fixture failed.
    #[error("teardown of fixture '{fixture}' failed during {phase}")]
    Teardown {
        /// Name of the fixture whose teardown failed.
        fixture: &'static str,

        /// The lifecycle phase that was being executed.
        phase: PhaseKind,

        /// The error reported by the fixture.
        #[source]
        source: BoxedError,
    },

    /// This thread gave up waiting for other threads, either because another thread of the same
    /// trial has failed or because the trial driver interrupted the iteration.
    #[error("aborted while waiting for other threads of the trial")]
    Aborted,

    /// The trial driver interrupted the iteration, so its measurement is void and no result is
    /// reported.
    #[error("iteration was interrupted and has no result")]
    Interrupted,

    /// The thread was assigned to a subgroup that does not participate in the benchmark.
    ///
    /// This is a configuration error and is never retried.
    #[error("harness failed to distribute threads among groups properly: subgroup {subgroup_index} has no role")]
    GroupDistribution {
        /// The subgroup index the thread was assigned to.
        subgroup_index: usize,
    },

    /// A configuration parameter required by a fixture was not supplied.
    #[error("required parameter '{name}' was not supplied")]
    MissingParam {
        /// Name of the missing parameter.
        name: String,
    },

    /// A configuration parameter was supplied but could not be parsed into the expected type.
    #[error("parameter '{name}' has invalid value '{value}': {problem}")]
    InvalidParam {
        /// Name of the parameter.
        name: String,

        /// The value as supplied.
        value: String,

        /// A human-readable description of the problem.
        problem: String,
    },
}

impl Error {
    /// Whether this error was caused by a failure elsewhere in the trial rather than by the
    /// thread that returned it.
    #[must_use]
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Aborted | Self::Interrupted)
    }
}

/// A specialized `Result` type for harness operations, returning the crate's [`Error`] type as
/// the error value.
pub type Result<T> = std::result::Result<T, Error>;
