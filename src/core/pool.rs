// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A bounded pool of worker threads executing single-element units of work.

use super::util::Status;
use crate::error::{ReductionError, WorkerFault};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Number of threads to spawn in a worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> Result<NonZeroUsize, ReductionError> {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .map_err(|e| {
                    ReductionError::pool_exhaustion(format!(
                        "getting the available parallelism failed: {e}"
                    ))
                }),
            ThreadCount::Count(count) => Ok(count),
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a pool fails.
    Always,
}

/// A builder for [`WorkerPool`].
#[derive(Clone, Copy, Debug)]
pub struct PoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Maximum number of units waiting in the queue before submitters block.
    /// Defaults to twice the number of threads.
    pub queue_capacity: Option<NonZeroUsize>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
            queue_capacity: None,
        }
    }
}

impl PoolBuilder {
    /// Spawns a worker pool.
    ///
    /// The pool is shut down when dropped, or explicitly with
    /// [`WorkerPool::shutdown()`].
    pub fn build(&self) -> Result<WorkerPool, ReductionError> {
        WorkerPool::new(self)
    }

    /// Spawns a worker pool, runs the given function with it, and shuts the
    /// pool down, whether the function returns or panics.
    ///
    /// ```
    /// # use poolreduce::{PoolBuilder, ThreadCount};
    /// let pool_builder = PoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     ..PoolBuilder::default()
    /// };
    /// let answer = pool_builder
    ///     .scope(|pool| pool.submit(|| 6 * 7).unwrap().wait())
    ///     .unwrap();
    /// assert_eq!(answer, Ok(42));
    /// ```
    pub fn scope<R>(&self, f: impl FnOnce(&WorkerPool) -> R) -> Result<R, ReductionError> {
        let pool = self.build()?;
        let result = f(&pool);
        pool.shutdown();
        Ok(result)
    }
}

/// A type-erased unit of work, ready to run on a worker thread.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue of units waiting for a worker thread.
struct Queue {
    tasks: VecDeque<Task>,
    capacity: usize,
    /// Set once the pool is shutting down: no more units are accepted.
    closed: bool,
}

/// Context shared between the submitters and the worker threads.
struct SharedContext {
    queue: Status<Queue>,
    /// Number of units submitted so far, also used to number them.
    submitted: CachePadded<AtomicU64>,
    /// Number of units that panicked so far.
    faulted: CachePadded<AtomicU64>,
}

/// A fixed set of worker threads that execute submitted units of work.
///
/// Each unit runs exactly once. A unit that panics is reported as a
/// [`WorkerFault`] on its [`UnitHandle`], without affecting other units nor
/// the worker thread that ran it.
///
/// A pool can be shared by several submitting threads, which is how the
/// [`MultiJobCoordinator`](crate::MultiJobCoordinator) bounds the total number
/// of workers across jobs.
pub struct WorkerPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// Context shared with the worker threads.
    shared: Arc<SharedContext>,
}

/// Handle to a worker thread in a pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Creates a new pool using the given parameters.
    fn new(builder: &PoolBuilder) -> Result<Self, ReductionError> {
        let num_threads: usize = builder.num_threads.count()?.into();
        let capacity = match builder.queue_capacity {
            Some(capacity) => capacity.get(),
            None => num_threads.saturating_mul(2),
        };

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match builder.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                return Err(ReductionError::pool_exhaustion(
                    "Pinning threads to CPUs is not implemented on this platform.",
                ))
            }
        }

        let shared = Arc::new(SharedContext {
            queue: Status::new(Queue {
                tasks: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            submitted: CachePadded::new(AtomicU64::new(0)),
            faulted: CachePadded::new(AtomicU64::new(0)),
        });

        // If anything fails below, dropping the partially built pool joins the
        // threads spawned so far.
        let mut pool = WorkerPool {
            threads: Vec::with_capacity(num_threads),
            shared,
        };

        let (startup_tx, startup_rx) = mpsc::channel();
        for id in 0..num_threads {
            let context = ThreadContext {
                id,
                shared: pool.shared.clone(),
            };
            let cpu_pinning = builder.cpu_pinning;
            let startup = startup_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("poolreduce-worker-{id}"))
                .spawn(move || {
                    let pinned = pin_current_thread(id, cpu_pinning);
                    let ready = pinned.is_ok();
                    // The receiver outlives the startup phase of every thread.
                    let _ = startup.send(pinned);
                    if ready {
                        context.run()
                    }
                })
                .map_err(|e| {
                    log_error!("[main thread] Failed to spawn worker thread #{id}: {e}");
                    ReductionError::pool_exhaustion(format!(
                        "failed to spawn worker thread #{id}: {e}"
                    ))
                })?;
            pool.threads.push(WorkerThreadHandle { handle });
        }
        drop(startup_tx);

        for _ in 0..num_threads {
            match startup_rx.recv() {
                Ok(Ok(())) => (),
                Ok(Err(reason)) => return Err(ReductionError::pool_exhaustion(reason)),
                Err(_) => {
                    return Err(ReductionError::pool_exhaustion(
                        "a worker thread exited during startup",
                    ))
                }
            }
        }
        log_debug!("[main thread] Spawned {num_threads} worker threads");

        Ok(pool)
    }

    /// Returns the number of worker threads that have been spawned in this
    /// pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        // A pool is never built without threads.
        NonZeroUsize::new(self.threads.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the number of units submitted to this pool so far.
    pub fn units_submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::SeqCst)
    }

    /// Returns the number of units that panicked on this pool so far.
    pub fn units_faulted(&self) -> u64 {
        self.shared.faulted.load(Ordering::SeqCst)
    }

    /// Submits a unit of work, returning a handle to its result.
    ///
    /// This blocks while the queue is full. The returned handle can be waited
    /// on, or dropped if the result isn't needed: the unit runs either way.
    ///
    /// Fails with [`ReductionError::PoolExhaustion`] if the pool is shutting
    /// down.
    pub fn submit<T: Send + 'static>(
        &self,
        unit: impl FnOnce() -> T + Send + 'static,
    ) -> Result<UnitHandle<T>, ReductionError> {
        self.submit_within(unit, None)
    }

    /// Submits a unit of work like [`submit()`](Self::submit), but gives up
    /// with [`ReductionError::Timeout`] if the queue stays full for the given
    /// duration. The unit is then dropped without running.
    pub fn submit_timeout<T: Send + 'static>(
        &self,
        unit: impl FnOnce() -> T + Send + 'static,
        timeout: Duration,
    ) -> Result<UnitHandle<T>, ReductionError> {
        self.submit_within(unit, Some(timeout))
    }

    fn submit_within<T: Send + 'static>(
        &self,
        unit: impl FnOnce() -> T + Send + 'static,
        timeout: Option<Duration>,
    ) -> Result<UnitHandle<T>, ReductionError> {
        let is_full = |queue: &mut Queue| !queue.closed && queue.tasks.len() >= queue.capacity;
        let mut queue = match timeout {
            None => self.shared.queue.wait_while(is_full),
            Some(timeout) => {
                let (queue, timed_out) = self.shared.queue.wait_timeout_while(timeout, is_full);
                if timed_out {
                    log_warn!("[main thread] Queue still full after {timeout:?}");
                    return Err(ReductionError::Timeout {
                        waited: timeout,
                        pending: queue.tasks.len(),
                    });
                }
                queue
            }
        };
        if queue.closed {
            return Err(ReductionError::pool_exhaustion(
                "the pool doesn't accept units after shutdown",
            ));
        }

        let id = self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(Status::new(Slot::Pending));
        let task: Task = Box::new({
            let slot = slot.clone();
            let shared = self.shared.clone();
            move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(unit)).map_err(|payload| {
                    shared.faulted.fetch_add(1, Ordering::SeqCst);
                    WorkerFault::from_panic(id, payload)
                });
                if let Err(_fault) = &outcome {
                    log_error!("[worker] Unit #{id} faulted: {}", _fault.message);
                }
                slot.notify_all(Slot::Done(outcome));
            }
        });
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.queue.wake_all();

        log_trace!("[main thread] Submitted unit #{id}");
        Ok(UnitHandle { unit: id, slot })
    }

    /// Shuts the pool down: no more units are accepted, units already queued
    /// are drained, and all the worker threads are joined.
    pub fn shutdown(self) {
        // The work happens in the `Drop` implementation.
        drop(self)
    }
}

impl Drop for WorkerPool {
    /// Joins all the threads in the pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying threads to finish...");
        self.shared.queue.update(|queue| queue.closed = true);

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Pins the calling thread to the CPU with the given index, according to the
/// policy. Only [`CpuPinningPolicy::Always`] turns a failure into an error.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    let pin = || -> Result<(), nix::Error> {
        let mut cpu_set = CpuSet::new();
        cpu_set.set(id)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    };
    match cpu_pinning {
        CpuPinningPolicy::No => Ok(()),
        CpuPinningPolicy::IfSupported => {
            match pin() {
                Ok(()) => log_debug!("Pinned thread #{id} to CPU #{id}"),
                Err(_e) => log_warn!("Failed to set CPU affinity for thread #{id}: {_e}"),
            }
            Ok(())
        }
        CpuPinningPolicy::Always => match pin() {
            Ok(()) => {
                log_debug!("Pinned thread #{id} to CPU #{id}");
                Ok(())
            }
            Err(e) => Err(format!("Failed to set CPU affinity for thread #{id}: {e}")),
        },
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    // Unsupported policies are rejected before spawning any thread.
    Ok(())
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index.
    id: usize,
    /// Context shared with the pool.
    shared: Arc<SharedContext>,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&self) {
        loop {
            let task = {
                let mut queue = self
                    .shared
                    .queue
                    .wait_while(|queue| queue.tasks.is_empty() && !queue.closed);
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        log_debug!("[worker {}] Queue closed and drained, exiting", self.id);
                        break;
                    }
                }
            };
            // A slot was freed for blocked submitters.
            self.shared.queue.wake_all();

            log_trace!("[worker {}] Running a unit", self.id);
            task();
        }
    }
}

/// Result slot of a unit of work.
enum Slot<T> {
    /// The unit hasn't completed yet.
    Pending,
    /// The unit completed or faulted.
    Done(Result<T, WorkerFault>),
}

/// Handle to the result of a unit submitted to a [`WorkerPool`].
///
/// Dropping the handle doesn't cancel the unit.
pub struct UnitHandle<T> {
    /// Pool-wide sequence number of the unit.
    unit: u64,
    slot: Arc<Status<Slot<T>>>,
}

impl<T> UnitHandle<T> {
    /// Returns the pool-wide sequence number of the unit.
    pub fn unit(&self) -> u64 {
        self.unit
    }

    /// Returns whether the unit has completed or faulted.
    pub fn is_settled(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Done(_))
    }

    /// Blocks until the unit completes, returning its output or the fault it
    /// raised.
    pub fn wait(self) -> Result<T, WorkerFault> {
        let mut guard = self
            .slot
            .wait_while(|slot| matches!(slot, Slot::Pending));
        Self::take(&mut guard)
    }

    /// Blocks until the unit completes or the timeout expires. On timeout, the
    /// handle is given back so that the caller can wait again.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, WorkerFault>, Self> {
        let (mut guard, timed_out) = self
            .slot
            .wait_timeout_while(timeout, |slot| matches!(slot, Slot::Pending));
        if timed_out {
            drop(guard);
            return Err(self);
        }
        Ok(Self::take(&mut guard))
    }

    fn take(slot: &mut Slot<T>) -> Result<T, WorkerFault> {
        match std::mem::replace(slot, Slot::Pending) {
            Slot::Done(outcome) => outcome,
            // Waiting consumes the handle, so a settled slot is read once.
            Slot::Pending => unreachable!("waited on a pending unit"),
        }
    }
}
