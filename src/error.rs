// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors and warnings reported by reductions.

use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::time::Duration;
use thiserror::Error;

/// Error that makes a reduction fail as a whole.
#[derive(Error, Debug)]
pub enum ReductionError {
    /// An average was requested over zero elements.
    #[error("cannot average an empty sequence")]
    EmptySequence,

    /// A unit of work panicked in a way that breaks the reduction.
    #[error(transparent)]
    WorkerFault(#[from] WorkerFault),

    /// The worker pool couldn't be started, or doesn't accept units anymore.
    #[error("worker pool exhausted: {reason}")]
    PoolExhaustion {
        /// Description of the underlying failure.
        reason: String,
    },

    /// Some contributions were lost, so a total covers only part of the
    /// sequence. Only returned by the APIs that drop the warnings, like
    /// [`ReductionJob::sum()`](crate::ReductionJob::sum).
    #[error("{lost} of {units} contribution(s) lost, the result is partial")]
    PartialResult {
        /// Number of elements missing from the total.
        lost: usize,
        /// Number of elements dispatched.
        units: usize,
    },

    /// A bounded wait expired before all units settled.
    #[error("timed out after {waited:?} with {pending} unit(s) still pending")]
    Timeout {
        /// Duration that was waited for.
        waited: Duration,
        /// Number of units that hadn't settled yet.
        pending: usize,
    },
}

impl ReductionError {
    pub(crate) fn pool_exhaustion(reason: impl Display) -> Self {
        ReductionError::PoolExhaustion {
            reason: reason.to_string(),
        }
    }
}

/// A unit of work that panicked while executing on a worker thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unit #{unit} faulted: {message}")]
pub struct WorkerFault {
    /// Pool-wide sequence number of the unit.
    pub unit: u64,
    /// Panic message, if it could be extracted from the payload.
    pub message: String,
}

impl WorkerFault {
    /// Builds a fault from the payload of a caught panic.
    pub(crate) fn from_panic(unit: u64, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unit panicked".to_owned()
        };
        Self { unit, message }
    }
}

/// The contribution of one element was lost because its unit faulted, but the
/// reduction still completed.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResultWarning<T> {
    /// Position of the element in the input sequence.
    pub index: usize,
    /// Value of the element that is missing from the result.
    pub lost: T,
}

impl<T: Debug> Display for PartialResultWarning<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "element #{} ({:?}) is missing from the result",
            self.index, self.lost
        )
    }
}

/// Two jobs reported a result under the same key; the last write won.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCollisionWarning<K> {
    /// Key shared by several jobs.
    pub key: K,
    /// Debug rendering of the value that was overwritten.
    pub replaced: String,
}

impl<K: Debug> Display for KeyCollisionWarning<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key {:?} written by several jobs, replaced {}",
            self.key, self.replaced
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fault_from_str_payload() {
        let fault = WorkerFault::from_panic(3, Box::new("arithmetic panic"));
        assert_eq!(fault.unit, 3);
        assert_eq!(fault.message, "arithmetic panic");
    }

    #[test]
    fn test_fault_from_string_payload() {
        let fault = WorkerFault::from_panic(4, Box::new(format!("bad item {}", 42)));
        assert_eq!(fault.message, "bad item 42");
    }

    #[test]
    fn test_fault_from_other_payload() {
        let fault = WorkerFault::from_panic(5, Box::new(42u8));
        assert_eq!(fault.message, "unit panicked");
    }

    #[test]
    fn test_display() {
        let err = ReductionError::from(WorkerFault {
            unit: 7,
            message: "boom".to_owned(),
        });
        assert_eq!(err.to_string(), "unit #7 faulted: boom");
        assert_eq!(
            ReductionError::EmptySequence.to_string(),
            "cannot average an empty sequence"
        );
        assert_eq!(
            ReductionError::PartialResult { lost: 1, units: 3 }.to_string(),
            "1 of 3 contribution(s) lost, the result is partial"
        );

        let warning = PartialResultWarning { index: 2, lost: 9u64 };
        assert_eq!(
            warning.to_string(),
            "element #2 (9) is missing from the result"
        );
    }
}
