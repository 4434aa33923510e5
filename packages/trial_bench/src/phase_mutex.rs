use std::sync::atomic::{AtomicU8, Ordering};

use crate::{BackoffPolicy, Control, Error, Result};

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;

/// The lifecycle actions that are each guarded by their own [`PhaseMutex`] per fixture.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum PhaseKind {
    /// Fixture construction and trial-level setup.
    #[display("trial setup")]
    SetupTrial,

    /// Trial-level cleanup after the last iteration.
    #[display("trial teardown")]
    TearTrial,

    /// Per-iteration setup.
    #[display("iteration setup")]
    SetupIteration,

    /// Per-iteration teardown.
    #[display("iteration teardown")]
    TearIteration,

    /// Per-invocation setup.
    #[display("invocation setup")]
    SetupInvocation,

    /// Per-invocation teardown.
    #[display("invocation teardown")]
    TearInvocation,
}

impl PhaseKind {
    /// All phase kinds, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::SetupTrial,
        Self::TearTrial,
        Self::SetupIteration,
        Self::TearIteration,
        Self::SetupInvocation,
        Self::TearInvocation,
    ];

    /// Whether the phase sets the fixture up (as opposed to tearing it down).
    #[must_use]
    pub fn is_setup(self) -> bool {
        matches!(
            self,
            Self::SetupTrial | Self::SetupIteration | Self::SetupInvocation
        )
    }

    fn index(self) -> usize {
        match self {
            Self::SetupTrial => 0,
            Self::TearTrial => 1,
            Self::SetupIteration => 2,
            Self::TearIteration => 3,
            Self::SetupInvocation => 4,
            Self::TearInvocation => 5,
        }
    }
}

/// A single-owner gate that picks exactly one thread to perform a lifecycle action.
///
/// The mutex never blocks. [`try_enter()`][Self::try_enter] either wins the Idle to Active
/// transition and returns a guard that resets the mutex to Idle when dropped, or it returns
/// `None` and the caller is expected to [`wait_idle()`][Self::wait_idle] for the winner to finish.
///
/// # Examples
///
/// ```
/// use trial_bench::PhaseMutex;
///
/// let mutex = PhaseMutex::new();
///
/// let guard = mutex.try_enter().unwrap();
/// assert!(mutex.is_active());
/// assert!(mutex.try_enter().is_none());
///
/// drop(guard);
/// assert!(!mutex.is_active());
/// ```
#[derive(Debug, Default)]
pub struct PhaseMutex {
    state: AtomicU8,
}

impl PhaseMutex {
    /// Creates a mutex in the Idle state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Attempts the Idle to Active transition.
    ///
    /// Returns a guard if this caller won. The guard returns the mutex to Idle on every exit
    /// path, including unwinding.
    #[must_use]
    pub fn try_enter(&self) -> Option<PhaseGuard<'_>> {
        // Acquire on success so the winner observes everything the previous owner did.
        self.state
            .compare_exchange(IDLE, ACTIVE, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PhaseGuard { mutex: self })
    }

    /// Whether some thread currently owns the mutex.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Sleeps with backoff until the mutex is Idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the trial is failing, including when the owner failed just
    /// before releasing the mutex, or if the driver interrupted the iteration.
    pub fn wait_idle(&self, control: &Control, policy: &BackoffPolicy) -> Result<()> {
        control.wait_while(policy, || self.is_active())?;

        // The owner marks the trial failing before it releases the mutex.
        if control.is_failing() {
            return Err(Error::Aborted);
        }

        Ok(())
    }

    fn release(&self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

/// Proof of ownership of a [`PhaseMutex`]. Dropping it returns the mutex to Idle.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the phase mutex"]
pub struct PhaseGuard<'a> {
    mutex: &'a PhaseMutex,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// The full set of phase mutexes owned by one fixture.
#[derive(Debug, Default)]
pub struct PhaseMutexes {
    mutexes: [PhaseMutex; 6],
}

impl PhaseMutexes {
    /// Creates a set with every mutex Idle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex guarding the given phase.
    #[must_use]
    pub fn get(&self, kind: PhaseKind) -> &PhaseMutex {
        self.mutexes
            .get(kind.index())
            .expect("every PhaseKind index is within the fixed-size mutex array")
    }

    /// Whether every mutex of the set is Idle.
    #[must_use]
    pub fn all_idle(&self) -> bool {
        self.mutexes.iter().all(|m| !m.is_active())
    }
}
