//! Integration tests for the fixture lifecycle and the measurement strategies of `trial_bench`.
//!
//! Every multithreaded test runs under a watchdog, as a broken rendezvous manifests as a hang.

use std::num::NonZero;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use new_zealand::nz;
use trial_bench::{
    BackoffPolicy, BenchmarkParams, BoxedError, Control, Error, Fixture, FixtureRegistry,
    IterationParams, LifecycleManager, Measurement, Mode, Params, PhaseKind, SampleTime, Trial,
    WorkerPool, normalize,
};

const THREADS: usize = 6;

fn control(mode: Mode, threads: NonZero<usize>) -> Control {
    Control::new(
        BenchmarkParams::new("integration", mode),
        IterationParams::new(nz!(1), Duration::from_millis(1)),
        threads,
    )
    .with_backoff(BackoffPolicy::exponential(
        Duration::from_millis(1),
        Duration::from_millis(4),
    ))
}

/// Counts its own setups and cleanups in counters shared with the test through the params.
#[derive(Debug)]
struct Shared {
    setups: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

// Fixtures are constructed from parameters only, so each test hands its counters over through
// a static keyed by the name it passes in the params.
static COUNTERS: parking_lot::Mutex<Vec<(String, Arc<AtomicUsize>, Arc<AtomicUsize>)>> =
    parking_lot::Mutex::new(Vec::new());

fn counters_for(test: &str) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let setups = Arc::new(AtomicUsize::new(0));
    let cleanups = Arc::new(AtomicUsize::new(0));

    COUNTERS.lock().push((
        test.to_string(),
        Arc::clone(&setups),
        Arc::clone(&cleanups),
    ));

    (setups, cleanups)
}

impl Fixture for Shared {
    fn from_params(params: &Params) -> Result<Self, BoxedError> {
        let test: String = params.get("test")?;

        let counters = COUNTERS.lock();
        let (_, setups, cleanups) = counters
            .iter()
            .find(|(name, _, _)| *name == test)
            .ok_or("no counters registered for test")?;

        Ok(Self {
            setups: Arc::clone(setups),
            cleanups: Arc::clone(cleanups),
        })
    }

    fn setup(&mut self) -> Result<(), BoxedError> {
        thread::sleep(Duration::from_millis(10));
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self) -> Result<(), BoxedError> {
        thread::sleep(Duration::from_millis(10));
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn shared_control(test: &str) -> Control {
    Control::new(
        BenchmarkParams::new(test, Mode::Throughput).with_params(Params::new().with("test", test)),
        IterationParams::new(nz!(1), Duration::from_millis(1)),
        NonZero::new(THREADS).unwrap(),
    )
    .with_backoff(BackoffPolicy::exponential(
        Duration::from_millis(1),
        Duration::from_millis(4),
    ))
}

#[test]
fn concurrent_acquire_sets_up_once_and_shares_instance() {
    testing::with_watchdog(|| {
        let (setups, _) = counters_for("acquire_once");
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<Shared>("shared");
        let control = shared_control("acquire_once");
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

        assert_eq!(setups.load(Ordering::SeqCst), 1);

        let first = states.first().unwrap();
        assert!(states.iter().all(|state| Arc::ptr_eq(first, state)));
    });
}

#[test]
fn concurrent_release_cleans_up_once_and_leaves_mutex_idle() {
    testing::with_watchdog(|| {
        let (_, cleanups) = counters_for("release_once");
        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<Shared>("shared");
        let control = shared_control("release_once");

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

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!state.mutexes().get(PhaseKind::TearTrial).is_active());
        assert!(!slot.is_live());
    });
}

/// Blocks in cleanup until the test lets it go.
#[derive(Debug)]
struct SlowCleanup {
    entered: Arc<AtomicBool>,
    proceed: Arc<AtomicBool>,
}

static SLOW_CLEANUP_SIGNALS: parking_lot::Mutex<Option<(Arc<AtomicBool>, Arc<AtomicBool>)>> =
    parking_lot::Mutex::new(None);

impl Fixture for SlowCleanup {
    fn from_params(_: &Params) -> Result<Self, BoxedError> {
        let (entered, proceed) = SLOW_CLEANUP_SIGNALS
            .lock()
            .clone()
            .ok_or("signals must be installed before construction")?;

        Ok(Self { entered, proceed })
    }

    fn cleanup(&self) -> Result<(), BoxedError> {
        self.entered.store(true, Ordering::SeqCst);

        while !self.proceed.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        Err("cleanup could not flush".into())
    }
}

#[test]
fn waiting_releasers_abort_when_winner_fails() {
    testing::with_watchdog(|| {
        let entered = Arc::new(AtomicBool::new(false));
        let proceed = Arc::new(AtomicBool::new(false));
        *SLOW_CLEANUP_SIGNALS.lock() = Some((Arc::clone(&entered), Arc::clone(&proceed)));

        let registry = FixtureRegistry::new();
        let lifecycle = LifecycleManager::new(&registry);
        let slot = lifecycle.slot::<SlowCleanup>("slow");
        let control = control(Mode::Throughput, nz!(4));

        lifecycle.acquire(&slot, &control).unwrap();

        thread::scope(|s| {
            let winner = s.spawn(|| lifecycle.release(&slot, &control));
            let cleanup_entered = || entered.load(Ordering::SeqCst);
            assert!(testing::wait_until(Duration::from_secs(5), cleanup_entered));

            let losers: Vec<_> = (0..3)
                .map(|_| s.spawn(|| lifecycle.release(&slot, &control)))
                .collect();

            // Let the losers start backing off before the winner fails.
            thread::sleep(Duration::from_millis(20));
            proceed.store(true, Ordering::SeqCst);

            assert!(matches!(
                winner.join().unwrap(),
                Err(Error::Teardown {
                    phase: PhaseKind::TearTrial,
                    ..
                })
            ));

            for loser in losers {
                assert!(matches!(loser.join().unwrap(), Err(Error::Aborted)));
            }
        });

        assert!(control.is_failing());
        assert!(!slot.is_live());
    });
}

#[test]
fn sample_buffer_peak_stays_within_twice_target() {
    // 1 ms of measurement allows 20 samples between thinnings.
    let target = 20;
    let mut peak = 0;

    // Stopping after every possible batch count observes the buffer at each size it reaches,
    // including the moment just before a halving.
    for stop_after in 1..=400_usize {
        let control = control(Mode::SampleTime, nz!(1));
        assert_eq!(control.target_samples(), 20);

        let calls = AtomicUsize::new(0);

        let raw = SampleTime::default().measure(
            &|calls: &AtomicUsize| {
                if calls.fetch_add(1, Ordering::Relaxed).saturating_add(1) == stop_after {
                    control.set_done();
                }
            },
            &calls,
            &control,
        );

        let len = raw.samples().len();
        assert!(
            len <= 2 * target,
            "{len} samples after {stop_after} batches exceed twice the target"
        );
        assert!(!raw.samples().is_empty());

        peak = peak.max(len);
    }

    // The buffer did grow past the target between halvings, so the bound was exercised.
    assert!(peak > target, "peak of {peak} samples never exceeded the target");
}

#[test]
fn spoiler_mid_batch_contributes_no_sample() {
    let control = Control::new(
        BenchmarkParams::new("spoiled", Mode::SampleTime),
        IterationParams::new(nz!(8), Duration::from_secs(1)),
        nz!(1),
    );
    let calls = AtomicUsize::new(0);

    let raw = SampleTime::default().measure(
        &|calls: &AtomicUsize| {
            // Complete two full batches, then spoil inside the third.
            if calls.fetch_add(1, Ordering::Relaxed) == 19 {
                control.spoil();
            }
        },
        &calls,
        &control,
    );

    assert_eq!(calls.load(Ordering::Relaxed), 20);
    assert_eq!(raw.measured_ops(), 2);
    assert_eq!(raw.samples().len(), 2);
    assert!(raw.is_spoiled());
}

#[test]
fn throughput_normalizes_by_batch_and_ops_per_invocation() {
    let (_, measured) = normalize(Mode::Throughput, 0, 100, nz!(10), nz!(5));

    assert_eq!(measured, 50);
}

#[test]
fn single_shot_reports_ops_per_invocation_and_one_invocation() {
    testing::with_watchdog(|| {
        #[derive(Debug, Default)]
        struct Invocations(AtomicUsize);

        impl Fixture for Invocations {
            fn from_params(_: &Params) -> Result<Self, BoxedError> {
                Ok(Self::default())
            }
        }

        let mut pool = WorkerPool::unpinned(nz!(1));
        let registry = FixtureRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let summary = Trial::builder("single", "invocations")
            .mode(Mode::SingleShotTime)
            .warmup_iterations(0)
            .measurement_iterations(nz!(1))
            .batch_size(nz!(1))
            .ops_per_invocation(nz!(3))
            .build()
            .execute_on(&mut pool, &registry, {
                let seen = Arc::clone(&seen);
                move |invocations: &Invocations| {
                    invocations.0.fetch_add(1, Ordering::Relaxed);
                    seen.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();

        let results = summary.iterations().first().unwrap();
        let result = results.first().unwrap();

        assert_eq!(result.all_ops(), 3);
        assert_eq!(result.measured_ops(), 3);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert_eq!(summary.mode(), Mode::SingleShotTime);
    });
}
