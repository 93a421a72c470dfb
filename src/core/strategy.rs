// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Accumulation disciplines combining per-element contributions into a total.

use super::util::Status;
use crate::error::{PartialResultWarning, ReductionError};
use crate::macros::{log_trace, log_warn};
use crate::number::Number;
use crossbeam_utils::CachePadded;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Discipline used by a job to combine elements into a total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Each unit receives the running total and returns the new one. The next
    /// unit is only submitted once the previous one has returned, so exactly
    /// one unit is in flight at any time.
    ///
    /// This gives a total order over combinations, but no parallelism at all:
    /// it only adds dispatch overhead over a sequential loop. It is kept as a
    /// point of comparison.
    ChainedFuture,
    /// Units are submitted without waiting, and each one adds its element into
    /// a cell shared by all the workers of the job. Units complete in any
    /// order.
    SharedCell,
}

/// Typed accumulator of a single job, tagged with its strategy.
pub enum AccumulatorState<T> {
    /// Running total owned by the job.
    Chained(ChainedTotal<T>),
    /// Cell shared with the units in flight.
    Shared(Arc<SharedCell<T>>),
}

impl<T: Number> AccumulatorState<T> {
    /// Creates a fresh accumulator for the given strategy.
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::ChainedFuture => AccumulatorState::Chained(ChainedTotal::new()),
            Strategy::SharedCell => AccumulatorState::Shared(Arc::new(SharedCell::new())),
        }
    }

    /// Returns the strategy this accumulator implements.
    pub fn strategy(&self) -> Strategy {
        match self {
            AccumulatorState::Chained(_) => Strategy::ChainedFuture,
            AccumulatorState::Shared(_) => Strategy::SharedCell,
        }
    }
}

/// Phase of a [`ChainedTotal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainPhase {
    /// No unit has been submitted yet.
    Idle,
    /// A unit carrying the current total is in flight.
    Submitted,
    /// The last unit's output replaced the total; ready for the next unit.
    Combined,
}

/// Running total of the chained-future strategy.
///
/// The total is handed to a unit with [`submit()`](Self::submit) and replaced
/// with the unit's output with [`combine()`](Self::combine). Submitting twice
/// without combining in between would break the order of combinations.
#[derive(Debug)]
pub struct ChainedTotal<T> {
    total: T,
    phase: ChainPhase,
    combined: usize,
}

impl<T: Number> Default for ChainedTotal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Number> ChainedTotal<T> {
    /// Creates a total of zero.
    pub fn new() -> Self {
        Self {
            total: T::default(),
            phase: ChainPhase::Idle,
            combined: 0,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    /// Returns the number of unit outputs combined so far.
    pub fn combined(&self) -> usize {
        self.combined
    }

    /// Returns the current total.
    pub fn total(&self) -> T {
        self.total
    }

    /// Marks a unit as submitted, returning the total it must carry.
    pub fn submit(&mut self) -> T {
        debug_assert_ne!(
            self.phase,
            ChainPhase::Submitted,
            "a unit is already in flight"
        );
        self.phase = ChainPhase::Submitted;
        self.total
    }

    /// Replaces the total with the output of the unit in flight.
    pub fn combine(&mut self, partial: T) {
        debug_assert_eq!(self.phase, ChainPhase::Submitted, "no unit in flight");
        self.total = partial;
        self.combined += 1;
        self.phase = ChainPhase::Combined;
        log_trace!("[job] Combined unit #{}", self.combined);
    }
}

/// Phase of a single element under the shared-cell strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitPhase {
    /// Registered with the cell, not yet picked up by a worker.
    Pending,
    /// Running on a worker.
    InFlight,
    /// Its contribution was added to the cell.
    Settled,
}

/// Number of units of a [`SharedCell`] in each phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Units registered but not started.
    pub pending: usize,
    /// Units currently running.
    pub in_flight: usize,
    /// Units done, whether their contribution was applied or lost.
    pub settled: usize,
}

impl Progress {
    fn unsettled(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// Accumulator of the shared-cell strategy, mutated in place by every unit.
///
/// Each read-modify-write of the total happens under a lock, so concurrent
/// units never lose each other's updates. The total is only final once
/// [`settle()`](Self::settle) returns: reading it earlier with
/// [`peek()`](Self::peek) may miss contributions of units still in flight.
pub struct SharedCell<T> {
    total: CachePadded<Mutex<T>>,
    progress: Status<Progress>,
    lost: Mutex<Vec<PartialResultWarning<T>>>,
}

impl<T: Number> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Number> SharedCell<T> {
    /// Creates a cell with a total of zero.
    pub fn new() -> Self {
        Self {
            total: CachePadded::new(Mutex::new(T::default())),
            progress: Status::new(Progress::default()),
            lost: Mutex::new(Vec::new()),
        }
    }

    /// Registers the element at the given index, returning the unit that will
    /// add it to this cell.
    pub fn register(self: &Arc<Self>, index: usize, value: T) -> SharedUnit<T> {
        self.progress.update(|progress| progress.pending += 1);
        SharedUnit {
            cell: self.clone(),
            index,
            value,
            phase: UnitPhase::Pending,
        }
    }

    /// Returns the number of units in each phase.
    pub fn progress(&self) -> Progress {
        *self.progress.lock()
    }

    /// Reads the total without waiting for units in flight.
    ///
    /// Before [`settle()`](Self::settle) returns, this is an undercount of the
    /// final value. It is not an error to call it, only a hazard.
    pub fn peek(&self) -> T {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every registered unit is settled, or until the timeout
    /// expires.
    pub fn settle(&self, timeout: Option<Duration>) -> Result<T, ReductionError> {
        let unsettled = |progress: &mut Progress| progress.unsettled() > 0;
        match timeout {
            None => drop(self.progress.wait_while(unsettled)),
            Some(timeout) => {
                let (guard, timed_out) = self.progress.wait_timeout_while(timeout, unsettled);
                if timed_out {
                    return Err(ReductionError::Timeout {
                        waited: timeout,
                        pending: guard.unsettled(),
                    });
                }
            }
        }
        Ok(self.peek())
    }

    /// Takes the warnings about contributions lost so far, sorted by index.
    pub fn take_lost(&self) -> Vec<PartialResultWarning<T>> {
        let mut lost = std::mem::take(
            &mut *self
                .lost
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        lost.sort_by_key(|warning| warning.index);
        lost
    }
}

/// A unit of work of the shared-cell strategy: one element to add into a
/// [`SharedCell`].
///
/// Dropping the unit settles it, whether it ran to completion, panicked, or
/// never ran. In the latter two cases the element is recorded as lost.
pub struct SharedUnit<T: Number> {
    cell: Arc<SharedCell<T>>,
    index: usize,
    value: T,
    phase: UnitPhase,
}

impl<T: Number> SharedUnit<T> {
    /// Returns the position of the element in the input sequence.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the current phase of this unit.
    pub fn phase(&self) -> UnitPhase {
        self.phase
    }

    /// Adds the element into the cell with the given operation. This is meant
    /// to run on a worker thread.
    pub fn apply(mut self, combine: &(impl Fn(T, T) -> T + ?Sized)) {
        self.cell.progress.update(|progress| {
            progress.pending -= 1;
            progress.in_flight += 1;
        });
        self.phase = UnitPhase::InFlight;
        log_trace!("[worker] Unit for element #{} in flight", self.index);

        {
            // A combine that panicked never wrote, so the poisoned value is
            // still consistent.
            let mut total = self.cell.total.lock().unwrap_or_else(PoisonError::into_inner);
            *total = combine(*total, self.value);
        }
        self.phase = UnitPhase::Settled;
    }
}

impl<T: Number> Drop for SharedUnit<T> {
    fn drop(&mut self) {
        if self.phase != UnitPhase::Settled {
            log_warn!(
                "[worker] Contribution of element #{} ({:?}) lost in phase {:?}",
                self.index,
                self.value,
                self.phase
            );
            self.cell
                .lost
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(PartialResultWarning {
                    index: self.index,
                    lost: self.value,
                });
        }

        let phase = self.phase;
        self.cell.progress.update(|progress| {
            match phase {
                UnitPhase::Pending => progress.pending -= 1,
                UnitPhase::InFlight | UnitPhase::Settled => progress.in_flight -= 1,
            }
            progress.settled += 1;
        });
        log_trace!("[worker] Element #{} settled", self.index);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn add(a: u64, b: u64) -> u64 {
        a + b
    }

    #[test]
    fn test_accumulator_state_tag() {
        assert_eq!(
            AccumulatorState::<u64>::new(Strategy::ChainedFuture).strategy(),
            Strategy::ChainedFuture
        );
        assert_eq!(
            AccumulatorState::<u64>::new(Strategy::SharedCell).strategy(),
            Strategy::SharedCell
        );
    }

    #[test]
    fn test_chained_phases() {
        let mut chain = ChainedTotal::<u64>::new();
        assert_eq!(chain.phase(), ChainPhase::Idle);

        for (i, x) in [1, 2, 3].into_iter().enumerate() {
            let carried = chain.submit();
            assert_eq!(chain.phase(), ChainPhase::Submitted);
            chain.combine(carried + x);
            assert_eq!(chain.phase(), ChainPhase::Combined);
            assert_eq!(chain.combined(), i + 1);
        }
        assert_eq!(chain.total(), 6);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "a unit is already in flight")]
    fn test_chained_double_submit() {
        let mut chain = ChainedTotal::<u64>::new();
        chain.submit();
        chain.submit();
    }

    #[test]
    fn test_shared_cell_concurrent_units() {
        let cell = Arc::new(SharedCell::<u64>::new());
        let units = (0..=1000)
            .map(|i| cell.register(i as usize, i))
            .collect::<Vec<_>>();
        assert_eq!(cell.progress().pending, 1001);

        std::thread::scope(|scope| {
            let mut chunks = units.into_iter().peekable();
            while chunks.peek().is_some() {
                let chunk = chunks.by_ref().take(100).collect::<Vec<_>>();
                scope.spawn(move || {
                    for unit in chunk {
                        unit.apply(&add);
                    }
                });
            }
        });

        assert_eq!(cell.settle(None).unwrap(), 500 * 1001);
        assert_eq!(
            cell.progress(),
            Progress {
                pending: 0,
                in_flight: 0,
                settled: 1001
            }
        );
        assert!(cell.take_lost().is_empty());
    }

    #[test]
    fn test_shared_cell_panic_loses_contribution() {
        let cell = Arc::new(SharedCell::<u64>::new());
        let ok = cell.register(0, 10);
        let bad = cell.register(1, 5);

        ok.apply(&add);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            bad.apply(&|_: u64, _: u64| -> u64 { panic!("arithmetic panic") })
        }));
        assert!(result.is_err());

        assert_eq!(cell.settle(None).unwrap(), 10);
        assert_eq!(
            cell.take_lost(),
            vec![PartialResultWarning { index: 1, lost: 5 }]
        );
        // The poisoned lock is still usable.
        let after = cell.register(2, 1);
        after.apply(&add);
        assert_eq!(cell.settle(None).unwrap(), 11);
    }

    #[test]
    fn test_shared_cell_abandoned_unit() {
        let cell = Arc::new(SharedCell::<u64>::new());
        let unit = cell.register(3, 7);
        assert_eq!(unit.phase(), UnitPhase::Pending);
        assert_eq!(unit.index(), 3);
        drop(unit);

        assert_eq!(cell.settle(None).unwrap(), 0);
        assert_eq!(
            cell.take_lost(),
            vec![PartialResultWarning { index: 3, lost: 7 }]
        );
    }

    #[test]
    fn test_shared_cell_settle_timeout() {
        let cell = Arc::new(SharedCell::<u64>::new());
        let unit = cell.register(0, 1);

        let result = cell.settle(Some(Duration::from_millis(10)));
        assert!(matches!(
            result,
            Err(ReductionError::Timeout { pending: 1, .. })
        ));

        unit.apply(&add);
        assert_eq!(cell.settle(Some(Duration::from_secs(60))).unwrap(), 1);
    }

    #[test]
    fn test_shared_cell_peek_undercounts() {
        let cell = Arc::new(SharedCell::<u64>::new());
        let first = cell.register(0, 4);
        let second = cell.register(1, 6);
        first.apply(&add);

        // Reading before settlement misses the unit still pending.
        assert_eq!(cell.peek(), 4);
        second.apply(&add);
        assert_eq!(cell.settle(None).unwrap(), 10);
    }
}
