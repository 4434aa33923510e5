use std::sync::Arc;

use scopeguard::ScopeGuard;
use tracing::{debug, trace, warn};

use crate::{
    BoxedError, Control, Error, Fixture, FixtureRegistry, FixtureSlot, FixtureState, Params,
    PhaseKind, Result,
};

/// Constructs, publishes and tears down fixtures so that every lifecycle action happens exactly
/// once per trial, no matter how many threads ask for it.
///
/// * Construction happens inside the exclusive section of the [`FixtureSlot`], after a second
///   check for a fixture published by a thread that raced ahead.
/// * Every other lifecycle action is guarded by a [`PhaseMutex`][crate::PhaseMutex]: the thread
///   that wins it performs the action, all others back off until it is done.
/// * Any failure sets the failure flag of the trial, after which every waiting thread gives up
///   with [`Error::Aborted`] instead of retrying.
#[derive(Debug)]
pub struct LifecycleManager<'a> {
    registry: &'a FixtureRegistry,
}

impl<'a> LifecycleManager<'a> {
    /// Creates a lifecycle manager operating on the slots of `registry`.
    #[must_use]
    pub fn new(registry: &'a FixtureRegistry) -> Self {
        Self { registry }
    }

    /// Returns the slot for fixtures of type `F` under `name`.
    #[must_use]
    pub fn slot<F: Fixture>(&self, name: &'static str) -> Arc<FixtureSlot<F>> {
        self.registry.slot(name)
    }

    /// Returns the live fixture of the slot, constructing and publishing it first if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Setup`] if construction or trial setup of the fixture failed and
    /// [`Error::Aborted`] if another thread of the trial has already failed.
    pub fn acquire<F: Fixture>(
        &self,
        slot: &FixtureSlot<F>,
        control: &Control,
    ) -> Result<Arc<FixtureState<F>>> {
        if let Some(state) = slot.load() {
            return Ok(state);
        }

        let _section = slot.lock_section();

        // Another thread may have published while we were waiting to enter.
        if let Some(state) = slot.load() {
            return Ok(state);
        }

        if control.is_failing() {
            return Err(Error::Aborted);
        }

        debug!(fixture = slot.name(), "constructing fixture");

        // A panic must fail the trial the same way an error does.
        let failing_on_unwind = scopeguard::guard((), |()| control.mark_failing());
        let constructed = construct::<F>(control.benchmark_params().params());
        ScopeGuard::into_inner(failing_on_unwind);

        match constructed {
            Ok(fixture) => {
                let state = Arc::new(FixtureState::new(slot.name(), fixture));
                state.set_ready(PhaseKind::SetupTrial, true);
                slot.publish(Arc::clone(&state));

                debug!(fixture = slot.name(), "fixture published");
                Ok(state)
            }
            Err(source) => {
                control.mark_failing();
                warn!(fixture = slot.name(), error = %source, "fixture construction failed");

                Err(Error::Setup {
                    fixture: slot.name(),
                    phase: PhaseKind::SetupTrial,
                    source,
                })
            }
        }
    }

    /// Cleans up the fixture of the slot once and clears the slot for the next trial.
    ///
    /// Called by every thread on the last iteration of a trial. Exactly one of them performs the
    /// cleanup, the others wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Teardown`] if cleanup failed and [`Error::Aborted`] if the trial is
    /// failing or the iteration was interrupted while waiting for another thread's cleanup.
    pub fn release<F: Fixture>(&self, slot: &FixtureSlot<F>, control: &Control) -> Result<()> {
        let outcome = match slot.load() {
            Some(state) => Self::run_phase(&state, control, PhaseKind::TearTrial, F::cleanup),
            None if control.is_failing() => Err(Error::Aborted),
            None => Ok(()),
        };

        slot.clear();

        outcome
    }

    /// Runs the iteration setup hook of the fixture once per iteration.
    ///
    /// # Errors
    ///
    /// See [`release()`][Self::release].
    pub fn setup_iteration<F: Fixture>(
        &self,
        state: &FixtureState<F>,
        control: &Control,
    ) -> Result<()> {
        Self::run_phase(state, control, PhaseKind::SetupIteration, F::setup_iteration)
    }

    /// Runs the iteration teardown hook of the fixture once per iteration.
    ///
    /// # Errors
    ///
    /// See [`release()`][Self::release].
    pub fn teardown_iteration<F: Fixture>(
        &self,
        state: &FixtureState<F>,
        control: &Control,
    ) -> Result<()> {
        Self::run_phase(state, control, PhaseKind::TearIteration, F::teardown_iteration)
    }

    /// Runs the invocation setup hook of the fixture unless it is already set up.
    ///
    /// # Errors
    ///
    /// See [`release()`][Self::release].
    pub fn setup_invocation<F: Fixture>(
        &self,
        state: &FixtureState<F>,
        control: &Control,
    ) -> Result<()> {
        Self::run_phase(state, control, PhaseKind::SetupInvocation, F::setup_invocation)
    }

    /// Runs the invocation teardown hook of the fixture unless it is already torn down.
    ///
    /// # Errors
    ///
    /// See [`release()`][Self::release].
    pub fn teardown_invocation<F: Fixture>(
        &self,
        state: &FixtureState<F>,
        control: &Control,
    ) -> Result<()> {
        Self::run_phase(state, control, PhaseKind::TearInvocation, F::teardown_invocation)
    }

    fn run_phase<F: Fixture>(
        state: &FixtureState<F>,
        control: &Control,
        kind: PhaseKind,
        hook: impl FnOnce(&F) -> std::result::Result<(), BoxedError>,
    ) -> Result<()> {
        let mutex = state.mutexes().get(kind);

        let Some(_guard) = mutex.try_enter() else {
            trace!(fixture = state.name(), %kind, "waiting for phase owner");
            return mutex.wait_idle(control, control.backoff_policy());
        };

        if control.is_failing() {
            return Err(Error::Aborted);
        }

        let setting_up = kind.is_setup();

        // Setup runs while not ready, teardown runs while ready. Otherwise someone did it already.
        if state.is_ready(kind) == setting_up {
            return Ok(());
        }

        let failing_on_unwind = scopeguard::guard((), |()| control.mark_failing());
        let outcome = hook(state.fixture());
        ScopeGuard::into_inner(failing_on_unwind);

        if let Err(source) = outcome {
            control.mark_failing();
            warn!(fixture = state.name(), %kind, error = %source, "lifecycle hook failed");

            return Err(if setting_up {
                Error::Setup {
                    fixture: state.name(),
                    phase: kind,
                    source,
                }
            } else {
                Error::Teardown {
                    fixture: state.name(),
                    phase: kind,
                    source,
                }
            });
        }

        state.set_ready(kind, setting_up);
        debug!(fixture = state.name(), %kind, "lifecycle phase completed");

        Ok(())
    }
}

fn construct<F: Fixture>(params: &Params) -> std::result::Result<F, BoxedError> {
    let mut fixture = F::from_params(params)?;
    fixture.setup()?;
    Ok(fixture)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use new_zealand::nz;

    use super::*;
    use crate::{BackoffPolicy, BenchmarkParams, IterationParams, Mode};

    const THREADS: usize = 8;

    // Fixture hooks are static functions, so the counters live in statics keyed per test fixture.
    static COUNTED_SETUPS: AtomicUsize = AtomicUsize::new(0);
    static COUNTED_CLEANUPS: AtomicUsize = AtomicUsize::new(0);
    static COUNTED_ITERATION_SETUPS: AtomicUsize = AtomicUsize::new(0);
    static COUNTED_ITERATION_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct Counted {
        id: usize,
    }

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    impl Fixture for Counted {
        fn from_params(_: &Params) -> std::result::Result<Self, BoxedError> {
            Ok(Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            })
        }

        fn setup(&mut self) -> std::result::Result<(), BoxedError> {
            // Widen the race window so that losers really do pile up behind the section.
            thread::sleep(Duration::from_millis(20));
            COUNTED_SETUPS.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn cleanup(&self) -> std::result::Result<(), BoxedError> {
            thread::sleep(Duration::from_millis(20));
            COUNTED_CLEANUPS.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn setup_iteration(&self) -> std::result::Result<(), BoxedError> {
            COUNTED_ITERATION_SETUPS.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn teardown_iteration(&self) -> std::result::Result<(), BoxedError> {
            COUNTED_ITERATION_TEARDOWNS.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailsSetup;

    impl Fixture for FailsSetup {
        fn from_params(_: &Params) -> std::result::Result<Self, BoxedError> {
            Ok(Self)
        }

        fn setup(&mut self) -> std::result::Result<(), BoxedError> {
            thread::sleep(Duration::from_millis(20));
            Err("cannot open database".into())
        }
    }

    #[derive(Debug)]
    struct FailsCleanup;

    impl Fixture for FailsCleanup {
        fn from_params(_: &Params) -> std::result::Result<Self, BoxedError> {
            Ok(Self)
        }

        fn cleanup(&self) -> std::result::Result<(), BoxedError> {
            Err("cannot close database".into())
        }
    }

    #[derive(Debug)]
    struct NeedsParam {
        size: usize,
    }

    impl Fixture for NeedsParam {
        fn from_params(params: &Params) -> std::result::Result<Self, BoxedError> {
            Ok(Self {
                size: params.get("size")?,
            })
        }
    }

    // Tests in this module share the statics above, so they must not run concurrently.
    static SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    fn control(params: Params) -> Control {
        Control::new(
            BenchmarkParams::new("lifecycle", Mode::Throughput).with_params(params),
            IterationParams::new(nz!(1), Duration::from_millis(10)),
            const { std::num::NonZero::new(THREADS).expect("literal must have non-zero value") },
        )
        .with_backoff(BackoffPolicy::exponential(
            Duration::from_millis(1),
            Duration::from_millis(8),
        ))
    }

    #[test]
    fn concurrent_acquire_constructs_once() {
        testing::with_watchdog(|| {
            let _serial = SERIAL.lock();
            COUNTED_SETUPS.store(0, Ordering::Relaxed);

            let registry = FixtureRegistry::new();
            let lifecycle = LifecycleManager::new(&registry);
            let slot = lifecycle.slot::<Counted>("counted");
            let control = control(Params::new());
            let start = Barrier::new(THREADS);

            let states: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            start.wait();
                            lifecycle.acquire(&slot, &control).unwrap()
                        })
                    })
                    .collect();

                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(COUNTED_SETUPS.load(Ordering::Relaxed), 1);

            let first = states.first().unwrap();
            for state in &states {
                assert!(Arc::ptr_eq(first, state));
                assert_eq!(state.id, first.id);
            }

            assert!(first.is_ready(PhaseKind::SetupTrial));
        });
    }

    #[test]
    fn concurrent_release_cleans_up_once() {
        testing::with_watchdog(|| {
            let _serial = SERIAL.lock();
            COUNTED_CLEANUPS.store(0, Ordering::Relaxed);

            let registry = FixtureRegistry::new();
            let lifecycle = LifecycleManager::new(&registry);
            let slot = lifecycle.slot::<Counted>("counted");
            let control = control(Params::new());

            let state = lifecycle.acquire(&slot, &control).unwrap();
            let start = Barrier::new(THREADS);

            thread::scope(|s| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            start.wait();
                            lifecycle.release(&slot, &control)
                        })
                    })
                    .collect();

                for handle in handles {
                    handle.join().unwrap().unwrap();
                }
            });

            assert_eq!(COUNTED_CLEANUPS.load(Ordering::Relaxed), 1);
            assert!(!state.is_ready(PhaseKind::TearTrial));
            assert!(!state.mutexes().get(PhaseKind::TearTrial).is_active());
            assert!(state.mutexes().all_idle());
            assert!(!slot.is_live());
        });
    }

    #[test]
    fn next_trial_constructs_a_fresh_fixture() {
        testing::with_watchdog(|| {
            let _serial = SERIAL.lock();

            let registry = FixtureRegistry::new();
            let lifecycle = LifecycleManager::new(&registry);
            let slot = lifecycle.slot::<Counted>("counted");

            let first = lifecycle.acquire(&slot, &control(Params::new())).unwrap();
            lifecycle.release(&slot, &control(Params::new())).unwrap();

            let second = lifecycle.acquire(&slot, &control(Params::new())).unwrap();

            assert!(!Arc::ptr_eq(&first, &second));
            assert_ne!(first.id, second.id);
        });
    }

    #[test]
    fn failed_setup_aborts_all_waiters() {
        testing::with_watchdog(|| {
            let registry = FixtureRegistry::new();
            let lifecycle = LifecycleManager::new(&registry);
            let slot = lifecycle.slot::<FailsSetup>("fails");
            let control = control(Params::new());
            let start = Barrier::new(THREADS);

            let results: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            start.wait();
                            lifecycle.acquire(&slot, &control).map(|_| ())
                        })
                    })
                    .collect();

                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let setup_failures = results
                .iter()
                .filter(|r| matches!(r, Err(Error::Setup { .. })))
                .count();
            let aborted = results
                .iter()
                .filter(|r| matches!(r, Err(Error::Aborted)))
                .count();

            assert_eq!(setup_failures, 1);
            assert_eq!(aborted, THREADS - 1);
            assert!(control.is_failing());
            assert!(!slot.is_live());
        });
    }

    #[test]
    fn missing_param_fails_setup() {
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<NeedsParam>("needs_param");
        let control = control(Params::new());

        let error = lifecycle.acquire(&slot, &control).unwrap_err();

        assert!(matches!(error, Error::Setup { phase: PhaseKind::SetupTrial, .. }));
        assert!(control.is_failing());
    }

    #[test]
    fn params_are_applied_on_construction() {
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<NeedsParam>("needs_param");
        let control = control(Params::new().with("size", "42"));

        let state = lifecycle.acquire(&slot, &control).unwrap();

        assert_eq!(state.size, 42);
    }

    #[test]
    fn failing_trial_skips_cleanup() {
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<FailsCleanup>("fails_cleanup");
        let control = control(Params::new());

        let state = lifecycle.acquire(&slot, &control).unwrap();
        control.mark_failing();

        assert!(matches!(lifecycle.release(&slot, &control), Err(Error::Aborted)));
        assert!(state.is_ready(PhaseKind::TearTrial));
        assert!(state.mutexes().all_idle());
        assert!(!slot.is_live());
    }

    #[test]
    fn failed_cleanup_marks_trial_failing() {
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<FailsCleanup>("fails_cleanup");
        let control = control(Params::new());

        lifecycle.acquire(&slot, &control).unwrap();

        assert!(matches!(
            lifecycle.release(&slot, &control),
            Err(Error::Teardown { phase: PhaseKind::TearTrial, .. })
        ));
        assert!(control.is_failing());
    }

    #[test]
    fn acquire_after_failure_is_aborted() {
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<NeedsParam>("needs_param");
        let control = control(Params::new().with("size", "1"));

        control.mark_failing();

        assert!(matches!(lifecycle.acquire(&slot, &control), Err(Error::Aborted)));
    }

    #[test]
    fn iteration_hooks_run_once_per_iteration() {
        testing::with_watchdog(|| {
            let _serial = SERIAL.lock();
            COUNTED_ITERATION_SETUPS.store(0, Ordering::Relaxed);
            COUNTED_ITERATION_TEARDOWNS.store(0, Ordering::Relaxed);

            let registry = FixtureRegistry::new();
            let lifecycle = LifecycleManager::new(&registry);
            let slot = lifecycle.slot::<Counted>("counted");
            let control = control(Params::new());
            let state = lifecycle.acquire(&slot, &control).unwrap();

            for _ in 0..3 {
                thread::scope(|s| {
                    let handles: Vec<_> = (0..THREADS)
                        .map(|_| s.spawn(|| lifecycle.setup_iteration(&state, &control)))
                        .collect();
                    for handle in handles {
                        handle.join().unwrap().unwrap();
                    }
                });

                assert!(state.is_ready(PhaseKind::SetupIteration));

                thread::scope(|s| {
                    let handles: Vec<_> = (0..THREADS)
                        .map(|_| s.spawn(|| lifecycle.teardown_iteration(&state, &control)))
                        .collect();
                    for handle in handles {
                        handle.join().unwrap().unwrap();
                    }
                });

                assert!(!state.is_ready(PhaseKind::TearIteration));
            }

            assert_eq!(COUNTED_ITERATION_SETUPS.load(Ordering::Relaxed), 3);
            assert_eq!(COUNTED_ITERATION_TEARDOWNS.load(Ordering::Relaxed), 3);
        });
    }

    #[test]
    fn invocation_hooks_toggle_readiness() {
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<NeedsParam>("needs_param");
        let control = control(Params::new().with("size", "1"));
        let state = lifecycle.acquire(&slot, &control).unwrap();

        lifecycle.setup_invocation(&state, &control).unwrap();
        assert!(state.is_ready(PhaseKind::SetupInvocation));

        lifecycle.teardown_invocation(&state, &control).unwrap();
        assert!(!state.is_ready(PhaseKind::SetupInvocation));
    }
}
