// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: worker pool, accumulator strategies, reduction jobs and their
//! coordination.

mod coordinator;
mod job;
mod pool;
mod strategy;
mod util;

pub use coordinator::{KeyedResultStore, KeyedResults, MultiJobCoordinator};
pub use job::{JobOptions, Reduction, ReductionJob};
pub use pool::{CpuPinningPolicy, PoolBuilder, ThreadCount, UnitHandle, WorkerPool};
pub use strategy::{
    AccumulatorState, ChainPhase, ChainedTotal, Progress, SharedCell, SharedUnit, Strategy,
    UnitPhase,
};
