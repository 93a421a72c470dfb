// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

pub mod baseline;
mod core;
mod error;
mod macros;
mod number;
mod producer;

pub use crate::core::{
    AccumulatorState, ChainPhase, ChainedTotal, CpuPinningPolicy, JobOptions, KeyedResultStore,
    KeyedResults, MultiJobCoordinator, PoolBuilder, Progress, Reduction, ReductionJob,
    SharedCell, SharedUnit, Strategy, ThreadCount, UnitHandle, UnitPhase, WorkerPool,
};
pub use error::{KeyCollisionWarning, PartialResultWarning, ReductionError, WorkerFault};
pub use number::Number;
pub use producer::{Next, PagedRecords, Producer, RecordPager, DEFAULT_PAGE_SIZE};

#[cfg(test)]
mod test {
    use super::*;
    use crate::baseline::{builtin_average, builtin_sum, sequential_average, sequential_sum};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    /// Record of a table, of which only one column is reduced.
    struct Row {
        id: usize,
        value: u32,
    }

    /// Table of rows served one page at a time.
    struct Table {
        rows: Vec<Row>,
    }

    impl RecordPager for &Table {
        type Record = (usize, u32);

        fn fetch_page(&mut self, offset: usize, limit: usize) -> Vec<(usize, u32)> {
            self.rows
                .iter()
                .skip(offset)
                .take(limit)
                .map(|row| (row.id, row.value))
                .collect()
        }
    }

    fn random_table(len: usize) -> Table {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        Table {
            rows: (0..len)
                .map(|id| Row {
                    id,
                    value: rng.random_range(0..=10_000),
                })
                .collect(),
        }
    }

    fn pool() -> WorkerPool {
        PoolBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
            queue_capacity: None,
        }
        .build()
        .unwrap()
    }

    macro_rules! expand_tests {
        ( $strategy:expr, ) => {};
        ( $strategy:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($strategy);
            }

            expand_tests!($strategy, $($others)*);
        };
        ( $strategy:expr, $case:ident => fail($msg:expr), $( $others:tt )* ) => {
            #[test]
            #[should_panic(expected = $msg)]
            fn $case() {
                $crate::test::$case($strategy);
            }

            expand_tests!($strategy, $($others)*);
        };
    }

    macro_rules! strategy_tests {
        ( $mod:ident, $strategy:expr, $( $tests:tt )* ) => {
            mod $mod {
                use super::*;

                expand_tests!($strategy, $($tests)*);
            }
        };
    }

    strategy_tests!(
        chained_future,
        Strategy::ChainedFuture,
        test_paged_sum,
        test_paged_average,
        test_nested_sums,
        test_one_panic => fail("arithmetic panic"),
    );

    strategy_tests!(
        shared_cell,
        Strategy::SharedCell,
        test_paged_sum,
        test_paged_average,
        test_nested_sums,
        test_one_panic => fail("PartialResult { lost: 1, units: 4 }"),
    );

    fn test_paged_sum(strategy: Strategy) {
        let table = random_table(1_234);
        let expected = sequential_sum(Producer::from_pages(
            &table,
            DEFAULT_PAGE_SIZE,
            |r: &(usize, u32)| r.1,
        ));

        let pool = pool();
        let sum = ReductionJob::new(strategy)
            .sum(
                Producer::from_pages(&table, DEFAULT_PAGE_SIZE, |&(_, value): &(usize, u32)| value),
                &pool,
            )
            .unwrap();
        assert_eq!(sum, expected);
        assert_eq!(
            builtin_sum(Producer::from_pages(&table, 7, |r: &(usize, u32)| r.1)),
            expected
        );
        assert_eq!(pool.units_submitted(), 1_234);
    }

    fn test_paged_average(strategy: Strategy) {
        let table = random_table(500);
        let pool = pool();
        let average = ReductionJob::new(strategy)
            .average(
                Producer::from_pages(&table, DEFAULT_PAGE_SIZE, |r: &(usize, u32)| r.1 as u64),
                &pool,
            )
            .unwrap();
        let expected = sequential_average(Producer::from_pages(
            &table,
            DEFAULT_PAGE_SIZE,
            |r: &(usize, u32)| r.1 as u64,
        ));
        assert_eq!(average, expected.unwrap());
        let expected = builtin_average(Producer::from_pages(&table, 3, |r: &(usize, u32)| {
            r.1 as u64
        }));
        assert_eq!(average, expected.unwrap());
    }

    fn test_nested_sums(strategy: Strategy) {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        let sizes = [5, 50, 500, 1000];
        let sequences = sizes
            .iter()
            .map(|&len| {
                (0..len)
                    .map(|_| rng.random_range(0..=10_000))
                    .collect::<Vec<u64>>()
            })
            .collect::<Vec<_>>();

        let pool = pool();
        let results = MultiJobCoordinator::new(&pool, strategy)
            .run_by_size(sequences.clone())
            .unwrap();

        assert_eq!(results.results.len(), sizes.len());
        for sequence in sequences {
            let expected = builtin_sum(Producer::new(sequence.iter().copied()));
            assert_eq!(results.results[&sequence.len()], expected);
        }
        assert_eq!(pool.units_submitted(), 5 + 50 + 500 + 1000);
        assert_eq!(pool.num_threads().get(), 4);
    }

    fn test_one_panic(strategy: Strategy) {
        let pool = pool();
        ReductionJob::new(strategy)
            .with_combine(|total: u64, x| {
                if x == 0 {
                    panic!("arithmetic panic");
                }
                total + x
            })
            .sum(Producer::new([1, 2, 0, 3]), &pool)
            .unwrap();
    }
}
