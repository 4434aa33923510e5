use std::sync::Arc;

use scopeguard::ScopeGuard;
use tracing::{debug, trace};

use crate::{
    AverageTime, Control, Error, Fixture, FixtureSlot, FixtureState, IterationResult,
    LifecycleManager, Measurement, RawResult, Result, SampleTime, SingleShotTime, ThreadParams,
    Throughput,
};

/// The stages one thread goes through while executing one iteration.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum Phase {
    /// Acquiring fixtures and waiting for the rest of the thread group.
    #[display("init")]
    Init,

    /// Running the workload unmeasured until the driver opens the measurement window.
    #[display("warmup")]
    Warmup,

    /// Running the measurement strategy.
    #[display("measuring")]
    Measuring,

    /// Running the workload unmeasured until every thread has left its measurement window.
    #[display("warmdown")]
    Warmdown,

    /// Releasing fixtures after the last iteration of the trial.
    #[display("trial teardown")]
    TrialTeardown,

    /// The iteration is over.
    #[display("done")]
    Done,
}

/// Drives one thread through one iteration of a benchmark.
///
/// The controller holds everything the thread needs to reach its fixtures and the signals of
/// the iteration. It can be used for exactly one iteration; the last phase it entered is
/// available via [`phase()`][Self::phase], which is where it stopped if the iteration failed.
#[derive(Debug)]
pub struct PhaseController<'a, F> {
    lifecycle: &'a LifecycleManager<'a>,
    slot: &'a FixtureSlot<F>,
    control: &'a Control,
    thread: ThreadParams,
    phase: Phase,
}

impl<'a, F: Fixture> PhaseController<'a, F> {
    /// Creates a controller for the calling thread.
    #[must_use]
    pub fn new(
        lifecycle: &'a LifecycleManager<'a>,
        slot: &'a FixtureSlot<F>,
        control: &'a Control,
        thread: ThreadParams,
    ) -> Self {
        Self {
            lifecycle,
            slot,
            control,
            thread,
            phase: Phase::Init,
        }
    }

    /// The phase the controller is in, or stopped in.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Executes the iteration and returns what this thread measured.
    ///
    /// # Errors
    ///
    /// * [`Error::GroupDistribution`] if the thread belongs to a subgroup other than 0.
    /// * [`Error::Setup`] or [`Error::Teardown`] if a fixture hook failed on this thread.
    /// * [`Error::Aborted`] if another thread of the trial failed.
    /// * [`Error::Interrupted`] if the driver interrupted the iteration, in which case no result
    ///   is reported even though the measurement may have completed.
    pub fn run<M, W>(&mut self, strategy: &M, workload: &W) -> Result<IterationResult>
    where
        M: Measurement,
        W: Fn(&F) + ?Sized,
    {
        let control = self.control;

        // A panicking workload or hook must not leave the rest of the group waiting forever.
        let failing_on_unwind = scopeguard::guard((), |()| control.mark_failing());
        let outcome = self.run_phases(strategy, workload);
        ScopeGuard::into_inner(failing_on_unwind);

        if let Err(error) = &outcome {
            debug!(
                benchmark = control.benchmark_params().label(),
                thread = self.thread.thread_index(),
                phase = %self.phase,
                %error,
                "iteration failed"
            );
        }

        outcome
    }

    fn run_phases<M, W>(&mut self, strategy: &M, workload: &W) -> Result<IterationResult>
    where
        M: Measurement,
        W: Fn(&F) + ?Sized,
    {
        let control = self.control;
        let warm_phases = strategy.has_warm_phases();

        self.enter(Phase::Init);
        let state = self.init()?;

        let mut warm_ops: u64 = 0;

        if warm_phases {
            self.enter(Phase::Warmup);
            control.announce_warmup_ready();

            while control.warmup_should_wait() {
                workload(state.fixture());
                warm_ops = warm_ops.saturating_add(1);
            }
        }

        self.enter(Phase::Measuring);
        control.mark_measurement_started();
        let mut raw = strategy.measure(workload, state.fixture(), control);
        control.mark_measurement_stopped();

        self.enter(Phase::Warmdown);

        if warm_phases {
            control.announce_warmdown_ready();

            while control.warmdown_should_wait() {
                workload(state.fixture());
                warm_ops = warm_ops.saturating_add(1);
            }
        }

        raw.add_all_ops(warm_ops);
        self.tear_down_iteration(&state)?;

        if control.is_last_iteration() {
            self.enter(Phase::TrialTeardown);
            self.lifecycle.release(self.slot, control)?;
        }

        self.enter(Phase::Done);
        self.finish(strategy, raw)
    }

    fn init(&self) -> Result<Arc<FixtureState<F>>> {
        let control = self.control;

        if self.thread.subgroup_index() != 0 {
            control.mark_failing();

            return Err(Error::GroupDistribution {
                subgroup_index: self.thread.subgroup_index(),
            });
        }

        let state = self.lifecycle.acquire(self.slot, control)?;

        control.pre_setup()?;
        self.lifecycle.setup_iteration(&state, control)?;

        Ok(state)
    }

    fn tear_down_iteration(&self, state: &FixtureState<F>) -> Result<()> {
        let control = self.control;

        match control.pre_tear_down() {
            Ok(()) => {}
            Err(Error::Aborted) if control.is_interrupted() && !control.is_failing() => {
                trace!(
                    thread = self.thread.thread_index(),
                    "interrupted before teardown, forcing"
                );
                control.pre_tear_down_force();
            }
            Err(error) => return Err(error),
        }

        self.lifecycle.teardown_iteration(state, control)
    }

    fn finish<M: Measurement>(&self, strategy: &M, raw: RawResult) -> Result<IterationResult> {
        if raw.is_spoiled() || self.control.is_interrupted() {
            return Err(Error::Interrupted);
        }

        Ok(IterationResult::from_raw(strategy, raw, self.control))
    }

    fn enter(&mut self, phase: Phase) {
        trace!(
            thread = self.thread.thread_index(),
            from = %self.phase,
            to = %phase,
            "phase transition"
        );

        self.phase = phase;
    }
}

/// Executes one iteration of a throughput benchmark on the calling thread.
///
/// # Errors
///
/// See [`PhaseController::run()`].
pub fn run_throughput<F, W>(
    lifecycle: &LifecycleManager<'_>,
    slot: &FixtureSlot<F>,
    control: &Control,
    thread: ThreadParams,
    workload: &W,
) -> Result<IterationResult>
where
    F: Fixture,
    W: Fn(&F) + ?Sized,
{
    PhaseController::new(lifecycle, slot, control, thread).run(&Throughput, workload)
}

/// Executes one iteration of an average time benchmark on the calling thread.
///
/// # Errors
///
/// See [`PhaseController::run()`].
pub fn run_average_time<F, W>(
    lifecycle: &LifecycleManager<'_>,
    slot: &FixtureSlot<F>,
    control: &Control,
    thread: ThreadParams,
    workload: &W,
) -> Result<IterationResult>
where
    F: Fixture,
    W: Fn(&F) + ?Sized,
{
    PhaseController::new(lifecycle, slot, control, thread).run(&AverageTime, workload)
}

/// Executes one iteration of a sample time benchmark on the calling thread.
///
/// # Errors
///
/// See [`PhaseController::run()`].
pub fn run_sample_time<F, W>(
    lifecycle: &LifecycleManager<'_>,
    slot: &FixtureSlot<F>,
    control: &Control,
    thread: ThreadParams,
    workload: &W,
) -> Result<IterationResult>
where
    F: Fixture,
    W: Fn(&F) + ?Sized,
{
    PhaseController::new(lifecycle, slot, control, thread).run(&SampleTime, workload)
}

/// Executes one single shot iteration on the calling thread.
///
/// # Errors
///
/// See [`PhaseController::run()`].
pub fn run_single_shot<F, W>(
    lifecycle: &LifecycleManager<'_>,
    slot: &FixtureSlot<F>,
    control: &Control,
    thread: ThreadParams,
    workload: &W,
) -> Result<IterationResult>
where
    F: Fixture,
    W: Fn(&F) + ?Sized,
{
    PhaseController::new(lifecycle, slot, control, thread).run(&SingleShotTime, workload)
}
