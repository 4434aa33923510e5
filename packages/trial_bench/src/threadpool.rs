use std::any::Any;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::{iter, mem};

use many_cpus::ProcessorSet;
use parking_lot::Mutex;

/// The outcome of a task on one worker: its return value, or the payload it panicked with.
pub type TaskOutcome<R> = Result<R, Box<dyn Any + Send + 'static>>;

/// Pre-warmed worker threads that execute every iteration of a trial, so that thread creation
/// never happens between iterations.
///
/// Threads created via [`new()`][Self::new] are pinned to the processors of the given set, one
/// thread per processor. Threads created via [`unpinned()`][Self::unpinned] are left to the
/// operating system scheduler, which allows more threads than processors.
///
/// # Examples
///
/// ```
/// use many_cpus::ProcessorSet;
/// use new_zealand::nz;
/// use trial_bench::WorkerPool;
///
/// let pool = WorkerPool::new(&ProcessorSet::default());
/// println!("Pinned pool has {} threads", pool.thread_count());
///
/// let pool = WorkerPool::unpinned(nz!(3));
/// assert_eq!(pool.thread_count().get(), 3);
/// ```
///
/// # Lifecycle
///
/// Dropping the pool waits for all threads to finish executing their tasks.
#[derive(Debug)]
pub struct WorkerPool {
    command_txs: Vec<mpsc::Sender<Command>>,
    join_handles: Vec<JoinHandle<()>>,
    thread_count: NonZero<usize>,
}

impl WorkerPool {
    /// Creates a pool with one thread pinned to each processor in the set.
    #[must_use]
    pub fn new(processors: &ProcessorSet) -> Self {
        let (txs, rxs): (Vec<_>, Vec<_>) = iter::repeat_with(mpsc::channel)
            .take(processors.len())
            .unzip();

        let rxs = Arc::new(Mutex::new(rxs));

        let join_handles = processors
            .spawn_threads({
                let rxs = Arc::clone(&rxs);
                move |_| {
                    let rx = rxs
                        .lock()
                        .pop()
                        .expect("one receiver is created per processor the threads are spawned on");
                    worker_entrypoint(&rx);
                }
            })
            .into_vec();

        Self {
            thread_count: NonZero::new(txs.len())
                .expect("guarded by fact that ProcessorSet is never empty"),
            command_txs: txs,
            join_handles,
        }
    }

    /// Creates a pool of `thread_count` threads without processor affinity.
    #[must_use]
    pub fn unpinned(thread_count: NonZero<usize>) -> Self {
        let (txs, join_handles) = (0..thread_count.get())
            .map(|index| {
                let (tx, rx) = mpsc::channel();

                let handle = thread::Builder::new()
                    .name(format!("trial-worker-{index}"))
                    .spawn(move || worker_entrypoint(&rx))
                    .expect("the operating system must allow us to create worker threads");

                (tx, handle)
            })
            .unzip();

        Self {
            command_txs: txs,
            join_handles,
            thread_count,
        }
    }

    /// Returns the number of threads in the pool.
    #[must_use]
    pub fn thread_count(&self) -> NonZero<usize> {
        self.thread_count
    }

    /// Executes a task on all threads in the pool, passing each thread its index, and waits for
    /// all of them to complete.
    ///
    /// A panic inside the task is caught on the worker and returned as that worker's outcome,
    /// so one failing thread never leaves the pool short of a worker.
    #[cfg_attr(test, mutants::skip)] // If work does not get enqueued, deadlocks are very easy.
    #[expect(
        clippy::needless_pass_by_ref_mut,
        reason = "protects users from deadlock through concurrent usage"
    )]
    pub fn execute_task<'f, F, R>(&mut self, f: F) -> Box<[TaskOutcome<R>]>
    where
        F: FnOnce(usize) -> R + Clone + Send + 'f,
        R: Send + 'static,
    {
        // Two concurrent users of the same pool would deadlock each other, so `&mut` is
        // required even though nothing here mutates the pool.

        let (result_txs, result_rxs): (Vec<_>, Vec<_>) =
            iter::repeat_with(oneshot::channel::<TaskOutcome<R>>)
                .take(self.thread_count.get())
                .unzip();

        for (index, (tx, result_tx)) in self.command_txs.iter().zip(result_txs).enumerate() {
            let f = f.clone();
            let task: Box<dyn FnOnce() + Send + 'f> = Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || f(index)));

                result_tx.send(outcome).expect(
                    "receiver must still exist - this is mandatory for scoped lifetime logic",
                );
            });

            // SAFETY: The task only borrows data that outlives 'f, and we do not return from this
            // function until every worker has reported back through its result channel, so the
            // task finishes running before any of those borrows can end. The 'static lifetime
            // only exists to satisfy the channel type.
            let task = unsafe {
                mem::transmute::<Box<dyn FnOnce() + Send + 'f>, Box<dyn FnOnce() + Send + 'static>>(
                    task,
                )
            };

            tx.send(Command::Execute(task)).expect(
                "worker thread must still exist - the pool cannot operate without workers",
            );
        }

        result_rxs
            .into_iter()
            .map(|rx| {
                rx.recv()
                    .expect("worker catches panics, so it always reports an outcome")
            })
            .collect()
    }
}

impl Drop for WorkerPool {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // Shutting down from a dirty state could hide the original panic.
            return;
        }

        for tx in self.command_txs.drain(..) {
            tx.send(Command::Shutdown)
                .expect("worker thread must still exist until it is told to shut down");
        }

        for handle in self.join_handles.drain(..) {
            handle
                .join()
                .expect("worker threads catch task panics, so they never panic themselves");
        }
    }
}

enum Command {
    Execute(Box<dyn FnOnce() + Send>),
    Shutdown,
}

#[cfg_attr(test, mutants::skip)] // Impractical to test that things do not happen when worker function is missing.
fn worker_entrypoint(rx: &mpsc::Receiver<Command>) {
    while let Ok(Command::Execute(f)) = rx.recv() {
        f();
    }
}
