use std::sync::atomic::Ordering;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::comparisons::{Comparison, EntityCounts};
use crate::config::{Sampling, SgdConfig};
use crate::evaluate::{evaluate_all, Metrics};
use crate::factors::FactorTables;
use crate::partition::PartitionAssignment;
use crate::rng::XorShift64;
use crate::trainer::RunContext;

/// Decaying step size `alpha / (1 + beta * t)`.
#[inline(always)]
pub fn step_size(alpha: f64, beta: f64, t: usize) -> f64 {
    alpha / (1.0 + beta * t as f64)
}

/// Apply one squared-hinge step for `c`. Returns `false` when the comparison
/// already has margin at least 1 and nothing was written.
///
/// The three rows are snapshotted, updated locally and stored back with no
/// synchronization; another worker touching the same rows in between loses
/// its update or has it interleaved component by component.
pub fn sgd_step(
    tables: &FactorTables,
    counts: &EntityCounts,
    c: &Comparison,
    step_size: f64,
    lambda: f64,
) -> bool {
    let mut scratch = vec![0.0; 3 * tables.rank()];
    apply_step(tables, counts, c, step_size, lambda, &mut scratch)
}

// ── snapshot triad update: xu, xw, xl read, updated, stored ─────────────
// xu -= s * (g*(xw-xl) + lambda/n_u * xu)
// xw -= s * (g*xu      + lambda/n_w * xw)
// xl -= s * (-g*xu     + lambda/n_l * xl)
#[inline(always)]
fn apply_step(
    tables: &FactorTables,
    counts: &EntityCounts,
    c: &Comparison,
    step_size: f64,
    lambda: f64,
    scratch: &mut [f64],
) -> bool {
    let k = tables.rank();
    let (u, rest) = scratch.split_at_mut(k);
    let (xw, xl) = rest.split_at_mut(k);

    let user = c.user as usize;
    let winner = c.winner as usize;
    let loser = c.loser as usize;

    tables.users.read_row(user, u);
    tables.items.read_row(winner, xw);
    tables.items.read_row(loser, xl);

    let mut err = 1.0;
    for f in 0..k {
        err -= u[f] * (xw[f] - xl[f]);
    }
    // NaN compares false and is left alone too
    if !(err > 0.0) {
        return false;
    }

    let grad = -2.0 * err;
    let reg_u = lambda / counts.user_divisor(user);
    let reg_w = lambda / counts.item_divisor(winner);
    let reg_l = lambda / counts.item_divisor(loser);

    for f in 0..k {
        let (uf, wf, lf) = (u[f], xw[f], xl[f]);
        u[f] = uf - step_size * (grad * (wf - lf) + reg_u * uf);
        xw[f] = wf - step_size * (grad * uf + reg_w * wf);
        xl[f] = lf - step_size * (-grad * uf + reg_l * lf);
    }

    tables.users.write_row(user, u);
    tables.items.write_row(winner, xw);
    tables.items.write_row(loser, xl);
    true
}

/// Diagnostic evaluation recorded by worker 0.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub iteration: usize,
    pub step_size: f64,
    pub metrics: Metrics,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SgdOutcome {
    pub reports: Vec<ProgressReport>,
    /// Samples that produced a write.
    pub updates: u64,
    /// Samples already ranked with margin and left untouched.
    pub satisfied: u64,
    pub iterations_per_worker: usize,
    pub stopped_early: bool,
}

#[derive(Default)]
struct WorkerTally {
    reports: Vec<ProgressReport>,
    updates: u64,
    satisfied: u64,
    stopped_early: bool,
}

/// Run lock-free SGD on every thread of the context's pool.
///
/// Each worker performs `n_train * epochs / n_threads` iterations with its own
/// generator. With [`Sampling::Partitioned`], `partitions` must be provided and
/// worker `w` draws from partition `w mod P`.
pub fn run_sgd(
    ctx: &RunContext,
    partitions: Option<&PartitionAssignment>,
    config: &SgdConfig,
) -> SgdOutcome {
    let train = ctx.store.train();
    let n_threads = ctx.pool.current_num_threads().max(1);
    let n_train = train.len();

    if n_train == 0 {
        return SgdOutcome {
            reports: Vec::new(),
            updates: 0,
            satisfied: 0,
            iterations_per_worker: 0,
            stopped_early: false,
        };
    }

    let iterations = n_train.saturating_mul(config.epochs) / n_threads;
    let report_interval = (n_train.saturating_mul(config.report_every) / n_threads).max(1);
    let shutdown_interval = report_interval.min(n_train);
    let start_time = Instant::now();

    info!(
        workers = n_threads,
        comparisons = n_train,
        iterations_per_worker = iterations,
        alpha = config.alpha,
        beta = config.beta,
        lambda = config.lambda,
        sampling = ?config.sampling,
        "starting lock-free SGD"
    );

    let tallies: Vec<WorkerTally> = ctx.pool.install(|| {
        (0..n_threads)
            .into_par_iter()
            .map(|worker| {
                let pool: Option<&[usize]> = match (config.sampling, partitions) {
                    (Sampling::Partitioned, Some(p)) => {
                        let group = p.group(worker % p.n_parts());
                        (!group.is_empty()).then_some(group)
                    }
                    _ => None,
                };
                let schedule = Schedule {
                    iterations,
                    report_interval,
                    shutdown_interval,
                };
                run_worker(ctx, worker, pool, config, &schedule, start_time)
            })
            .collect()
    });

    let mut outcome = SgdOutcome {
        reports: Vec::new(),
        updates: 0,
        satisfied: 0,
        iterations_per_worker: iterations,
        stopped_early: false,
    };
    for t in tallies {
        outcome.reports.extend(t.reports);
        outcome.updates += t.updates;
        outcome.satisfied += t.satisfied;
        outcome.stopped_early |= t.stopped_early;
    }

    info!(
        updates = outcome.updates,
        satisfied = outcome.satisfied,
        elapsed_secs = start_time.elapsed().as_secs_f64(),
        "SGD finished"
    );
    outcome
}

struct Schedule {
    iterations: usize,
    report_interval: usize,
    shutdown_interval: usize,
}

fn run_worker(
    ctx: &RunContext,
    worker: usize,
    pool: Option<&[usize]>,
    config: &SgdConfig,
    schedule: &Schedule,
    start_time: Instant,
) -> WorkerTally {
    let train = ctx.store.train();
    let counts = ctx.store.counts();
    let tables = ctx.tables;
    let mut rng = XorShift64::for_worker(ctx.seed, worker);
    let mut scratch = vec![0.0; 3 * tables.rank()];
    let mut tally = WorkerTally::default();

    for t in 1..=schedule.iterations {
        let idx = match pool {
            Some(group) => group[rng.next_index(group.len())],
            None => rng.next_index(train.len()),
        };
        let step = step_size(config.alpha, config.beta, t);

        if apply_step(tables, counts, &train[idx], step, config.lambda, &mut scratch) {
            tally.updates += 1;
        } else {
            tally.satisfied += 1;
        }

        if t % schedule.shutdown_interval == 0 && ctx.shutdown.load(Ordering::Relaxed) {
            tally.stopped_early = true;
            break;
        }
        if worker == 0 && t % schedule.report_interval == 0 {
            let metrics = evaluate_all(ctx.evaluators, tables);
            let elapsed = start_time.elapsed().as_secs_f64();
            info!(
                worker,
                iteration = t,
                step_size = step,
                test_error = ?metrics.test_error,
                ndcg = ?metrics.ndcg,
                elapsed_secs = elapsed,
                "progress"
            );
            tally.reports.push(ProgressReport {
                iteration: t,
                step_size: step,
                metrics,
                elapsed_secs: elapsed,
            });
        }
    }
    tally
}
