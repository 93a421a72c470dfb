// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Concurrent reduction jobs, one per input sequence, sharing a pool and a
//! keyed result store.

use super::job::{JobOptions, ReductionJob};
use super::pool::WorkerPool;
use super::strategy::Strategy;
use super::util::Status;
use crate::error::{KeyCollisionWarning, PartialResultWarning, ReductionError};
use crate::macros::{log_debug, log_error, log_warn};
use crate::number::Number;
use crate::producer::Producer;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Results of a [`MultiJobCoordinator`] run.
#[derive(Debug, Clone)]
pub struct KeyedResults<K, T> {
    /// Final total of each job, by key.
    pub results: HashMap<K, T>,
    /// Keys written by more than one job, in the order the collisions
    /// happened.
    pub collisions: Vec<KeyCollisionWarning<K>>,
    /// Contributions lost by shared-cell jobs, with the key of their job.
    pub warnings: Vec<(K, PartialResultWarning<T>)>,
}

/// Mapping from job key to result, written concurrently by the jobs of a
/// [`MultiJobCoordinator`].
///
/// When two jobs write the same key, the last write wins and the collision is
/// recorded. Which job writes last isn't deterministic.
pub struct KeyedResultStore<K, T> {
    results: Mutex<HashMap<K, T>>,
    collisions: Mutex<Vec<KeyCollisionWarning<K>>>,
    warnings: Mutex<Vec<(K, PartialResultWarning<T>)>>,
}

impl<K: Eq + Hash + Clone + Debug, T: Number> Default for KeyedResultStore<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Debug, T: Number> KeyedResultStore<K, T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            collisions: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Writes the result of a job, returning the value it replaced if another
    /// job already wrote this key.
    pub fn insert(&self, key: K, value: T) -> Option<T> {
        let replaced = self.results.lock().unwrap().insert(key.clone(), value);
        if let Some(old) = replaced {
            log_warn!("[coordinator] Key {key:?} written twice, replacing {old:?} with {value:?}");
            self.collisions.lock().unwrap().push(KeyCollisionWarning {
                key,
                replaced: format!("{old:?}"),
            });
        }
        replaced
    }

    /// Records the contributions lost by the job with the given key.
    pub fn add_warnings(&self, key: &K, warnings: Vec<PartialResultWarning<T>>) {
        if warnings.is_empty() {
            return;
        }
        self.warnings
            .lock()
            .unwrap()
            .extend(warnings.into_iter().map(|warning| (key.clone(), warning)));
    }

    /// Returns the number of distinct keys written so far.
    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    /// Returns whether no result was written so far.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the store into its results.
    pub fn into_results(self) -> KeyedResults<K, T> {
        KeyedResults {
            results: self.results.into_inner().unwrap(),
            collisions: self.collisions.into_inner().unwrap(),
            warnings: self.warnings.into_inner().unwrap(),
        }
    }
}

/// Runs one [`ReductionJob`] per input sequence, all at once, and gathers
/// their results by key.
///
/// Every job submits its units to the same [`WorkerPool`], so the total number
/// of worker threads stays bounded by the pool size however many jobs run.
///
/// ```
/// # use poolreduce::{MultiJobCoordinator, PoolBuilder, Strategy};
/// let pool = PoolBuilder::default().build().unwrap();
/// let coordinator = MultiJobCoordinator::new(&pool, Strategy::SharedCell);
///
/// let results = coordinator
///     .run_all([("a", vec![1u64, 2, 3]), ("b", vec![10, 20])])
///     .unwrap();
/// assert_eq!(results.results["a"], 6);
/// assert_eq!(results.results["b"], 30);
/// ```
pub struct MultiJobCoordinator<'pool, T> {
    pool: &'pool WorkerPool,
    job: ReductionJob<T>,
    /// Maximum number of jobs running at once, unbounded if `None`.
    max_jobs: Option<NonZeroUsize>,
}

/// Slot of a running job, released when its controller thread exits.
struct JobSlot<'a> {
    running: &'a Status<usize>,
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        self.running.update(|running| *running -= 1);
    }
}

impl<'pool, T: Number> MultiJobCoordinator<'pool, T> {
    /// Creates a coordinator running jobs with the given strategy on the given
    /// pool.
    pub fn new(pool: &'pool WorkerPool, strategy: Strategy) -> Self {
        Self {
            pool,
            job: ReductionJob::new(strategy),
            max_jobs: None,
        }
    }

    /// Limits the number of jobs running at once. Further inputs are only
    /// pulled once a running job has settled.
    pub fn with_max_jobs(mut self, max_jobs: NonZeroUsize) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    /// Sets the options of every job.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.job = self.job.with_options(options);
        self
    }

    /// Replaces the operation run by the units of every job.
    pub fn with_combine(
        mut self,
        combine: impl Fn(T, T) -> T + Send + Sync + 'static,
    ) -> Self {
        self.job = self.job.with_combine(combine);
        self
    }

    /// Launches one job per `(key, sequence)` input without waiting for any of
    /// them, then waits for all of them.
    ///
    /// Inputs are pulled lazily: each sequence is handed to its job as soon as
    /// it is produced. If any job fails, the error of the first failed job (in
    /// launch order) is returned once all the jobs have joined.
    ///
    /// Each job runs on its own controller thread, which mostly waits on the
    /// pool. Without [`with_max_jobs()`](Self::with_max_jobs), one controller
    /// thread is spawned per input, all at once.
    pub fn run_all<K, S>(
        &self,
        inputs: impl IntoIterator<Item = (K, S)>,
    ) -> Result<KeyedResults<K, T>, ReductionError>
    where
        K: Eq + Hash + Clone + Debug + Send,
        S: IntoIterator<Item = T>,
        S::IntoIter: Send,
    {
        let store = KeyedResultStore::new();
        let running = Status::new(0usize);

        let outcomes = std::thread::scope(|scope| {
            let mut controllers = Vec::new();
            let mut launch_error = None;
            for (index, (key, sequence)) in inputs.into_iter().enumerate() {
                let slot = self.acquire_slot(&running);
                let producer = Producer::new(sequence);
                let job = &self.job;
                let pool = self.pool;
                let store = &store;
                log_debug!("[coordinator] Launching job #{index} for key {key:?}");
                let spawned = std::thread::Builder::new()
                    .name(format!("poolreduce-job-{index}"))
                    .spawn_scoped(scope, move || {
                        let _slot = slot;
                        let reduction = job.run(producer, pool)?;
                        store.add_warnings(&key, reduction.warnings);
                        store.insert(key, reduction.value);
                        Ok(())
                    });
                match spawned {
                    Ok(controller) => controllers.push(controller),
                    Err(e) => {
                        log_error!("[coordinator] Failed to launch job #{index}: {e}");
                        launch_error = Some(ReductionError::pool_exhaustion(format!(
                            "failed to launch job #{index}: {e}"
                        )));
                        break;
                    }
                }
            }

            log_debug!(
                "[coordinator] Waiting for {} job(s) to settle",
                controllers.len()
            );
            let mut outcomes = controllers
                .into_iter()
                .map(|controller| match controller.join() {
                    Ok(outcome) => outcome,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect::<Vec<Result<(), ReductionError>>>();
            if let Some(e) = launch_error {
                outcomes.push(Err(e));
            }
            outcomes
        });

        outcomes.into_iter().collect::<Result<Vec<()>, _>>()?;
        let results = store.into_results();
        log_debug!(
            "[coordinator] All jobs settled, {} key(s) and {} collision(s)",
            results.results.len(),
            results.collisions.len()
        );
        Ok(results)
    }

    /// Waits until fewer than the maximum number of jobs are running, and
    /// reserves a slot for a new one.
    fn acquire_slot<'a>(&self, running: &'a Status<usize>) -> JobSlot<'a> {
        let mut guard =
            running.wait_while(|running| self.max_jobs.is_some_and(|max| *running >= max.get()));
        *guard += 1;
        drop(guard);
        JobSlot { running }
    }

    /// Runs one job per sequence, keyed by the sequence's length.
    ///
    /// Sequences of equal lengths collide in the results.
    pub fn run_by_size(
        &self,
        sequences: impl IntoIterator<Item = Vec<T>>,
    ) -> Result<KeyedResults<usize, T>, ReductionError> {
        self.run_all(
            sequences
                .into_iter()
                .map(|sequence| (sequence.len(), sequence)),
        )
    }
}
