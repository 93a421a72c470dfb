// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A reduction job: one pass over one sequence, one unit of work per element.

use super::pool::{UnitHandle, WorkerPool};
use super::strategy::{AccumulatorState, ChainedTotal, SharedCell, Strategy};
use crate::error::{PartialResultWarning, ReductionError};
use crate::macros::{log_debug, log_error, log_warn};
use crate::number::Number;
use crate::producer::{Next, Producer};
use std::sync::Arc;
use std::time::Duration;

/// Options of a [`ReductionJob`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Upper bound on every blocking step of the job: each submission to a
    /// full queue, each unit under the chained-future strategy, and the final
    /// settlement under the shared-cell strategy. No bound by default.
    ///
    /// A unit that is still queued or running when the wait expires isn't
    /// cancelled.
    pub timeout: Option<Duration>,
}

/// Outcome of a [`ReductionJob`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction<T> {
    /// Accumulated total.
    pub value: T,
    /// Number of units dispatched to the pool, one per element.
    pub units: usize,
    /// Elements whose contribution is missing from the total.
    pub warnings: Vec<PartialResultWarning<T>>,
}

impl<T> Reduction<T> {
    /// Returns whether every element contributed to the total.
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Returns the number of elements whose contribution is in the total.
    pub fn contributed(&self) -> usize {
        self.units - self.warnings.len()
    }

    /// Fails with [`ReductionError::PartialResult`] if any contribution was
    /// lost.
    pub fn into_complete(self) -> Result<Self, ReductionError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(ReductionError::PartialResult {
                lost: self.warnings.len(),
                units: self.units,
            })
        }
    }
}

impl<T: Number> Reduction<T> {
    /// Divides the total by the number of elements that contributed to it.
    ///
    /// Fails with [`ReductionError::EmptySequence`] if no element was
    /// dispatched, and with [`ReductionError::PartialResult`] if every
    /// contribution was lost.
    pub fn average(&self) -> Result<f64, ReductionError> {
        if self.units == 0 {
            return Err(ReductionError::EmptySequence);
        }
        match self.contributed() {
            0 => Err(ReductionError::PartialResult {
                lost: self.warnings.len(),
                units: self.units,
            }),
            contributed => Ok(self.value.as_f64() / contributed as f64),
        }
    }
}

/// Operation run by each unit, combining the total with one element.
type CombineFn<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

/// Reduces a sequence on a [`WorkerPool`], one unit of work per element.
///
/// ```
/// # use poolreduce::{PoolBuilder, Producer, ReductionJob, Strategy, ThreadCount};
/// let pool = PoolBuilder {
///     num_threads: ThreadCount::try_from(4).unwrap(),
///     ..PoolBuilder::default()
/// }
/// .build()
/// .unwrap();
///
/// for strategy in [Strategy::ChainedFuture, Strategy::SharedCell] {
///     let job = ReductionJob::new(strategy);
///     let sum = job.sum(Producer::new([1u64, 2, 3, 4, 5]), &pool).unwrap();
///     assert_eq!(sum, 15);
/// }
/// ```
pub struct ReductionJob<T> {
    strategy: Strategy,
    options: JobOptions,
    combine: CombineFn<T>,
}

impl<T: Number> ReductionJob<T> {
    /// Creates a job that sums elements with the given strategy.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            options: JobOptions::default(),
            combine: Arc::new(|total: T, x: T| total + x),
        }
    }

    /// Sets the options of this job.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the addition run by each unit with the given operation. It is
    /// called with the current total and an element, and returns the new
    /// total.
    pub fn with_combine(
        mut self,
        combine: impl Fn(T, T) -> T + Send + Sync + 'static,
    ) -> Self {
        self.combine = Arc::new(combine);
        self
    }

    /// Returns the strategy of this job.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns the options of this job.
    pub fn options(&self) -> JobOptions {
        self.options
    }

    /// Drains the producer, submitting one unit per element to the pool, and
    /// waits until every unit is settled.
    ///
    /// Under [`Strategy::ChainedFuture`], a faulted unit fails the job. Under
    /// [`Strategy::SharedCell`], it is reported in
    /// [`Reduction::warnings`] instead.
    pub fn run<I: Iterator<Item = T>>(
        &self,
        mut producer: Producer<I>,
        pool: &WorkerPool,
    ) -> Result<Reduction<T>, ReductionError> {
        log_debug!(
            "[job] Starting a {:?} reduction on {} thread(s)",
            self.strategy,
            pool.num_threads()
        );
        let reduction = match AccumulatorState::new(self.strategy) {
            AccumulatorState::Chained(chain) => self.run_chained(chain, &mut producer, pool)?,
            AccumulatorState::Shared(cell) => self.run_shared(cell, &mut producer, pool)?,
        };
        log_debug!(
            "[job] Settled after {} unit(s): {:?}",
            reduction.units,
            reduction.value
        );
        Ok(reduction)
    }

    /// Runs the job and returns only the total.
    ///
    /// As the warnings aren't returned, a lost contribution fails with
    /// [`ReductionError::PartialResult`]. Use [`run()`](Self::run) to get a
    /// partial total.
    pub fn sum<I: Iterator<Item = T>>(
        &self,
        producer: Producer<I>,
        pool: &WorkerPool,
    ) -> Result<T, ReductionError> {
        let reduction = self.run(producer, pool)?.into_complete()?;
        Ok(reduction.value)
    }

    /// Runs the job and divides the total by the number of elements.
    ///
    /// Fails with [`ReductionError::EmptySequence`] if the producer yields no
    /// element, and with [`ReductionError::PartialResult`] if a contribution
    /// was lost.
    pub fn average<I: Iterator<Item = T>>(
        &self,
        producer: Producer<I>,
        pool: &WorkerPool,
    ) -> Result<f64, ReductionError> {
        self.run(producer, pool)?.into_complete()?.average()
    }

    fn run_chained<I: Iterator<Item = T>>(
        &self,
        mut chain: ChainedTotal<T>,
        producer: &mut Producer<I>,
        pool: &WorkerPool,
    ) -> Result<Reduction<T>, ReductionError> {
        while let Next::Value(x) = producer.next_value() {
            let carried = chain.submit();
            let combine = self.combine.clone();
            let handle = self.submit_unit(pool, move || combine(carried, x))?;
            // Waiting here serializes the whole job.
            let partial = self.wait_unit(handle)?;
            chain.combine(partial);
        }
        Ok(Reduction {
            value: chain.total(),
            units: chain.combined(),
            warnings: Vec::new(),
        })
    }

    fn run_shared<I: Iterator<Item = T>>(
        &self,
        cell: Arc<SharedCell<T>>,
        producer: &mut Producer<I>,
        pool: &WorkerPool,
    ) -> Result<Reduction<T>, ReductionError> {
        let mut units = 0;
        while let Next::Value(x) = producer.next_value() {
            let unit = cell.register(units, x);
            let combine = self.combine.clone();
            // The handle is dropped: the cell tracks settlement on its own.
            self.submit_unit(pool, move || unit.apply(&*combine))?;
            units += 1;
        }

        let value = cell.settle(self.options.timeout)?;
        let warnings = cell.take_lost();
        if !warnings.is_empty() {
            log_warn!(
                "[job] {} of {units} contribution(s) lost, the total is partial",
                warnings.len()
            );
        }
        Ok(Reduction {
            value,
            units,
            warnings,
        })
    }

    fn submit_unit<R: Send + 'static>(
        &self,
        pool: &WorkerPool,
        unit: impl FnOnce() -> R + Send + 'static,
    ) -> Result<UnitHandle<R>, ReductionError> {
        match self.options.timeout {
            None => pool.submit(unit),
            Some(timeout) => pool.submit_timeout(unit, timeout),
        }
    }

    fn wait_unit(&self, handle: UnitHandle<T>) -> Result<T, ReductionError> {
        let outcome = match self.options.timeout {
            None => handle.wait(),
            Some(timeout) => handle
                .wait_timeout(timeout)
                .map_err(|_handle| ReductionError::Timeout {
                    waited: timeout,
                    pending: 1,
                })?,
        };
        outcome.map_err(|fault| {
            log_error!("[job] Chain broken, {fault}");
            fault.into()
        })
    }
}
