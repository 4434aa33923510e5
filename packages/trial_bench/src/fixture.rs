use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard};

use crate::{BoxedError, Params, PhaseKind, PhaseMutexes};

/// Shared state needed by a benchmark workload, constructed once per trial and visible to every
/// thread of the trial.
///
/// The harness only protects the lifecycle of the fixture: it guarantees that exactly one thread
/// constructs it and exactly one thread cleans it up. While the workload runs, all threads access
/// the fixture concurrently through `&Self`, so any mutable state inside it must bring its own
/// synchronization.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// use trial_bench::{BoxedError, Fixture, Params};
///
/// #[derive(Debug)]
/// struct Counter {
///     step: u64,
///     value: AtomicU64,
/// }
///
/// impl Fixture for Counter {
///     fn from_params(params: &Params) -> Result<Self, BoxedError> {
///         Ok(Self {
///             step: params.get("step")?,
///             value: AtomicU64::new(0),
///         })
///     }
///
///     fn cleanup(&self) -> Result<(), BoxedError> {
///         self.value.store(0, Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
pub trait Fixture: Send + Sync + Sized + 'static {
    /// Constructs the fixture, applying the configuration parameters of the benchmark.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn from_params(params: &Params) -> Result<Self, BoxedError>;

    /// Trial-level setup, called once on the freshly constructed fixture before it is published
    /// to other threads.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn setup(&mut self) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Trial-level cleanup, called once after the last iteration of the trial.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn cleanup(&self) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Called once at the start of every iteration, by one of the threads.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn setup_iteration(&self) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Called once at the end of every iteration, by one of the threads.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn teardown_iteration(&self) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Called before an invocation, by one of the threads.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn setup_invocation(&self) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Called after an invocation, by one of the threads.
    ///
    /// # Errors
    ///
    /// Any error fails the trial.
    fn teardown_invocation(&self) -> Result<(), BoxedError> {
        Ok(())
    }
}

/// A published fixture together with its lifecycle bookkeeping.
///
/// Dereferences to the fixture itself, which is what workloads operate on.
#[derive(derive_more::Debug)]
pub struct FixtureState<F> {
    name: &'static str,

    #[debug(ignore)]
    fixture: F,

    ready_trial: AtomicBool,
    ready_iteration: AtomicBool,
    ready_invocation: AtomicBool,

    mutexes: PhaseMutexes,
}

impl<F> FixtureState<F> {
    pub(crate) fn new(name: &'static str, fixture: F) -> Self {
        Self {
            name,
            fixture,
            ready_trial: AtomicBool::new(false),
            ready_iteration: AtomicBool::new(false),
            ready_invocation: AtomicBool::new(false),
            mutexes: PhaseMutexes::new(),
        }
    }

    /// Name of the slot the fixture was published to.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The fixture.
    #[must_use]
    pub fn fixture(&self) -> &F {
        &self.fixture
    }

    /// Whether the level of setup that `kind` belongs to has been completed and not yet undone.
    #[must_use]
    pub fn is_ready(&self, kind: PhaseKind) -> bool {
        self.ready_flag(kind).load(Ordering::Acquire)
    }

    /// The phase mutexes of this fixture.
    #[must_use]
    pub fn mutexes(&self) -> &PhaseMutexes {
        &self.mutexes
    }

    pub(crate) fn set_ready(&self, kind: PhaseKind, ready: bool) {
        self.ready_flag(kind).store(ready, Ordering::Release);
    }

    fn ready_flag(&self, kind: PhaseKind) -> &AtomicBool {
        match kind {
            PhaseKind::SetupTrial | PhaseKind::TearTrial => &self.ready_trial,
            PhaseKind::SetupIteration | PhaseKind::TearIteration => &self.ready_iteration,
            PhaseKind::SetupInvocation | PhaseKind::TearInvocation => &self.ready_invocation,
        }
    }
}

impl<F> Deref for FixtureState<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.fixture
    }
}

/// The place one fixture is published to, shared by all threads of a trial.
///
/// Reading a live fixture is a single atomic load. Publishing and clearing happen inside the
/// exclusive section returned by [`lock_section()`][Self::lock_section].
#[derive(derive_more::Debug)]
pub struct FixtureSlot<F> {
    name: &'static str,

    #[debug(ignore)]
    current: ArcSwapOption<FixtureState<F>>,

    #[debug(ignore)]
    section: Mutex<()>,
}

impl<F> FixtureSlot<F> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: ArcSwapOption::const_empty(),
            section: Mutex::new(()),
        }
    }

    /// Name of the slot.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the live fixture, if one has been published.
    #[must_use]
    pub fn load(&self) -> Option<Arc<FixtureState<F>>> {
        self.current.load_full()
    }

    /// Whether a fixture is currently published.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.current.load().is_some()
    }

    /// Enters the exclusive section used for publishing and clearing.
    pub(crate) fn lock_section(&self) -> MutexGuard<'_, ()> {
        self.section.lock()
    }

    /// Publishes a fixture. The caller must hold the exclusive section.
    pub(crate) fn publish(&self, state: Arc<FixtureState<F>>) {
        self.current.store(Some(state));
    }

    /// Clears the slot so the next trial starts from a clean state.
    pub(crate) fn clear(&self) {
        let _section = self.lock_section();
        self.current.store(None);
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FixtureSlot<u32>: Send, Sync);
    assert_impl_all!(FixtureState<u32>: Send, Sync);

    #[test]
    fn slot_starts_empty() {
        let slot = FixtureSlot::<u32>::new("numbers");

        assert!(!slot.is_live());
        assert!(slot.load().is_none());
        assert_eq!(slot.name(), "numbers");
    }

    #[test]
    fn publish_and_clear() {
        let slot = FixtureSlot::new("numbers");

        {
            let _section = slot.lock_section();
            slot.publish(Arc::new(FixtureState::new("numbers", 7_u32)));
        }

        let state = slot.load().unwrap();
        assert_eq!(**state, 7);

        slot.clear();
        assert!(!slot.is_live());

        // Clearing does not invalidate references already handed out.
        assert_eq!(*state.fixture(), 7);
    }

    #[test]
    fn ready_flags_are_per_level() {
        let state = FixtureState::new("numbers", 0_u32);

        state.set_ready(PhaseKind::SetupIteration, true);

        assert!(state.is_ready(PhaseKind::SetupIteration));
        assert!(state.is_ready(PhaseKind::TearIteration));
        assert!(!state.is_ready(PhaseKind::SetupTrial));
        assert!(!state.is_ready(PhaseKind::SetupInvocation));
    }
}
