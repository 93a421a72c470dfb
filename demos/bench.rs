// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool comparing reductions on a worker pool with sequential and library
//! reductions.

use clap::{Parser, ValueEnum};
use poolreduce::baseline::{builtin_average, builtin_sum, sequential_average, sequential_sum};
use poolreduce::{
    CpuPinningPolicy, JobOptions, MultiJobCoordinator, PartialResultWarning, PoolBuilder,
    Producer, ReductionError, ReductionJob, Strategy, ThreadCount, WorkerPool,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::time::{Duration, Instant};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), ReductionError> {
    let pool = PoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
        queue_capacity: None,
    }
    .build()?;
    let strategy = match cli.strategy {
        StrategyCli::ChainedFuture => Strategy::ChainedFuture,
        StrategyCli::SharedCell => Strategy::SharedCell,
    };
    let options = JobOptions {
        timeout: cli.timeout_ms.map(Duration::from_millis),
    };
    let mut rng = ChaCha12Rng::seed_from_u64(cli.seed);

    println!(
        "{:?} strategy on {} worker thread(s)",
        strategy,
        pool.num_threads()
    );
    match cli.mode {
        Mode::Sum => {
            let job = ReductionJob::new(strategy).with_options(options);
            for &size in &cli.sizes {
                let input = random_input(&mut rng, size);
                compare_sums(&input, &job, &pool)?;
            }
        }
        Mode::Average => {
            let job = ReductionJob::new(strategy).with_options(options);
            for &size in &cli.sizes {
                let input = random_input(&mut rng, size);
                compare_averages(&input, &job, &pool)?;
            }
        }
        Mode::Nested => {
            let inputs = cli
                .sizes
                .iter()
                .map(|&size| random_input(&mut rng, size))
                .collect::<Vec<_>>();
            let coordinator = MultiJobCoordinator::new(&pool, strategy).with_options(options);
            compare_nested(&inputs, &coordinator)?;
        }
    }

    println!(
        "{} unit(s) submitted, {} faulted",
        pool.units_submitted(),
        pool.units_faulted()
    );
    pool.shutdown();
    Ok(())
}

fn random_input(rng: &mut ChaCha12Rng, size: usize) -> Vec<u64> {
    (0..size).map(|_| rng.random_range(0..=10_000)).collect()
}

/// Runs the given function, printing how long it took.
fn timed<R>(label: &str, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    println!("  {label:<20} {:?}", start.elapsed());
    result
}

fn compare_sums(
    input: &[u64],
    job: &ReductionJob<u64>,
    pool: &WorkerPool,
) -> Result<(), ReductionError> {
    println!("sum of {} element(s)", input.len());
    let for_loop = timed("standard for loop", || {
        sequential_sum(Producer::new(black_box(input).iter().copied()))
    });
    let pooled = timed("worker pool", || {
        job.run(Producer::new(black_box(input).iter().copied()), pool)
    })?;
    let builtin = timed("built-in sum", || {
        builtin_sum(Producer::new(black_box(input).iter().copied()))
    });
    let rayon = timed("rayon", || black_box(input).par_iter().sum::<u64>());

    print_warnings(&pooled.warnings);
    println!(
        "  sum = {for_loop}, all equal: {}",
        for_loop == pooled.value && for_loop == builtin && for_loop == rayon
    );
    Ok(())
}

fn compare_averages(
    input: &[u64],
    job: &ReductionJob<u64>,
    pool: &WorkerPool,
) -> Result<(), ReductionError> {
    println!("average of {} element(s)", input.len());
    let for_loop = timed("standard for loop", || {
        sequential_average(Producer::new(black_box(input).iter().copied()))
    })?;
    let reduction = timed("worker pool", || {
        job.run(Producer::new(black_box(input).iter().copied()), pool)
    })?;
    // Averages over the elements that contributed, if some were lost.
    let pooled = reduction.average()?;
    let builtin = timed("built-in sum", || {
        builtin_average(Producer::new(black_box(input).iter().copied()))
    })?;
    let rayon = timed("rayon", || {
        black_box(input).par_iter().sum::<u64>() as f64 / input.len() as f64
    });

    print_warnings(&reduction.warnings);
    println!(
        "  average = {for_loop}, all equal: {}",
        for_loop == pooled && for_loop == builtin && for_loop == rayon
    );
    Ok(())
}

fn compare_nested(
    inputs: &[Vec<u64>],
    coordinator: &MultiJobCoordinator<'_, u64>,
) -> Result<(), ReductionError> {
    println!("sums of {} sequence(s)", inputs.len());
    let for_loop = timed("standard for loop", || {
        inputs
            .iter()
            .map(|input| sequential_sum(Producer::new(black_box(input).iter().copied())))
            .collect::<Vec<u64>>()
    });
    let pooled = timed("worker pool", || coordinator.run_by_size(inputs.to_vec()))?;
    let builtin = timed("built-in sum", || {
        inputs
            .iter()
            .map(|input| builtin_sum(Producer::new(black_box(input).iter().copied())))
            .collect::<Vec<u64>>()
    });
    let rayon = timed("rayon", || {
        inputs
            .iter()
            .map(|input| black_box(input).par_iter().sum::<u64>())
            .collect::<Vec<u64>>()
    });

    // With colliding sizes, the stored sum is the one of any sequence of that
    // size.
    let pooled_matches = pooled.results.iter().all(|(&size, &sum)| {
        inputs
            .iter()
            .zip(&for_loop)
            .any(|(input, &expected)| input.len() == size && expected == sum)
    });
    for collision in &pooled.collisions {
        println!("  warning: {collision}");
    }
    for (size, warning) in &pooled.warnings {
        println!("  warning: job {size}: {warning}");
    }
    println!(
        "  {} key(s), all equal: {}",
        pooled.results.len(),
        pooled_matches && for_loop == builtin && for_loop == rayon
    );
    Ok(())
}

fn print_warnings(warnings: &[PartialResultWarning<u64>]) {
    for warning in warnings {
        println!("  warning: {warning}");
    }
    if !warnings.is_empty() {
        println!("  the pooled result is partial");
    }
}

#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// How units of work combine their results.
    #[arg(long, value_enum, default_value_t = StrategyCli::ChainedFuture)]
    strategy: StrategyCli,

    /// Reduction to run.
    #[arg(long, value_enum, default_value_t = Mode::Sum)]
    mode: Mode,

    /// Numbers of items in the inputs.
    #[arg(long, value_delimiter = ',', default_values_t = [5, 50, 500, 1000, 10000])]
    sizes: Vec<usize>,

    /// Seed of the random inputs.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Upper bound on each wait of a job, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

/// How units of work combine their results.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StrategyCli {
    /// Each unit waits for the previous one.
    ChainedFuture,
    /// Units add into a shared total as they complete.
    SharedCell,
}

/// Reduction to run.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Sum each input.
    Sum,
    /// Average each input.
    Average,
    /// Sum all inputs concurrently, keyed by size.
    Nested,
}
