// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Single-threaded reductions, used as references for correctness and timing.

use crate::error::ReductionError;
use crate::number::Number;
use crate::producer::{Next, Producer};

/// Sums the values with an explicit loop over the producer.
pub fn sequential_sum<T: Number, I: Iterator<Item = T>>(mut producer: Producer<I>) -> T {
    let mut total = T::default();
    while let Next::Value(x) = producer.next_value() {
        total = total + x;
    }
    total
}

/// Sums the values with [`Iterator::sum`].
pub fn builtin_sum<T: Number, I: Iterator<Item = T>>(producer: Producer<I>) -> T {
    producer.sum()
}

/// Averages the values with an explicit loop over the producer.
pub fn sequential_average<T: Number, I: Iterator<Item = T>>(
    mut producer: Producer<I>,
) -> Result<f64, ReductionError> {
    let mut total = T::default();
    let mut count = 0usize;
    while let Next::Value(x) = producer.next_value() {
        total = total + x;
        count += 1;
    }
    average_of(total, count)
}

/// Averages the values with [`Iterator::sum`], counting them on the way.
pub fn builtin_average<T: Number, I: Iterator<Item = T>>(
    producer: Producer<I>,
) -> Result<f64, ReductionError> {
    let mut count = 0usize;
    let total: T = producer.inspect(|_| count += 1).sum();
    average_of(total, count)
}

fn average_of<T: Number>(total: T, count: usize) -> Result<f64, ReductionError> {
    if count == 0 {
        return Err(ReductionError::EmptySequence);
    }
    Ok(total.as_f64() / count as f64)
}
