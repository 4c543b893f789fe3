//! Alternating rankSVM: block-coordinate descent over the factor tables.
//!
//! Each round solves one convex subproblem per user with the item table held
//! fixed, then walks every partition in parallel solving a single-row problem
//! per comparison with the user table held fixed. Partitions share item rows,
//! so two partitions may overwrite the same row in the item phase; the last
//! store wins.

use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AlternatingConfig;
use crate::evaluate::{evaluate_all, test_error, Metrics};
use crate::partition::PartitionAssignment;
use crate::solver::{ConvexSolver, SolverKind, SolverParams, SvmProblem};
use crate::trainer::RunContext;

thread_local! {
    // (feature block, solver row buffer)
    static SCRATCH: RefCell<(Vec<f64>, Vec<f64>)> =
        const { RefCell::new((Vec::new(), Vec::new())) };
}

impl From<&AlternatingConfig> for SolverParams {
    fn from(config: &AlternatingConfig) -> Self {
        Self {
            kind: SolverKind::L2LossSvcDual,
            c: config.c,
            eps: config.eps,
            max_iter: config.max_solver_iter,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: usize,
    pub metrics: Metrics,
    /// Misordered fraction of the training comparisons after the round.
    pub train_error: f64,
    pub skipped_users: usize,
    pub skipped_items: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockOutcome {
    pub reports: Vec<RoundReport>,
    pub rounds_completed: usize,
    pub stopped_early: bool,
}

/// Solve every user's subproblem against the current item table. Returns the
/// number of users whose update was skipped.
///
/// Users without training comparisons keep their row.
pub fn solve_user_phase(
    ctx: &RunContext,
    solver: &dyn ConvexSolver,
    params: &SolverParams,
) -> usize {
    let store = ctx.store;
    let tables = ctx.tables;
    let k = tables.rank();
    let train = store.train();

    ctx.pool.install(|| {
        (0..store.n_users())
            .into_par_iter()
            .filter(|&u| !store.user_comparisons(u).is_empty())
            .map(|u| {
                let group = store.user_comparisons(u);
                SCRATCH.with(|cell| {
                    let mut borrow = cell.borrow_mut();
                    let (ref mut features, ref mut row) = *borrow;
                    features.clear();
                    features.resize(group.len() * k, 0.0);
                    row.clear();
                    row.resize(k, 0.0);

                    // row r: V_winner - V_loser
                    for (r, &idx) in group.iter().enumerate() {
                        let c = &train[idx];
                        let out = &mut features[r * k..(r + 1) * k];
                        tables.items.read_row(c.winner as usize, out);
                        tables.items.read_row(c.loser as usize, row);
                        for (o, l) in out.iter_mut().zip(row.iter()) {
                            *o -= l;
                        }
                    }

                    let problem = SvmProblem::new(&features[..], group.len(), k);
                    match solver.solve(&problem, params) {
                        Ok(w) => {
                            tables.users.write_row(u, &w);
                            0usize
                        }
                        Err(e) => {
                            debug!(user = u, error = %e, "skipping user update");
                            1usize
                        }
                    }
                })
            })
            .sum()
    })
}

/// Walk every partition in parallel, solving `[U_user, -U_user]` for each
/// comparison in order. Returns the number of skipped comparisons.
pub fn solve_item_phase(
    ctx: &RunContext,
    partitions: &PartitionAssignment,
    solver: &dyn ConvexSolver,
    params: &SolverParams,
) -> usize {
    let tables = ctx.tables;
    let k = tables.rank();
    let train = ctx.store.train();

    ctx.pool.install(|| {
        (0..partitions.n_parts())
            .into_par_iter()
            .map(|p| {
                let mut features = vec![0.0; 2 * k];
                let mut skipped = 0usize;
                for &idx in partitions.group(p) {
                    let c = &train[idx];
                    let (pos, neg) = features.split_at_mut(k);
                    tables.users.read_row(c.user as usize, pos);
                    for (n, x) in neg.iter_mut().zip(pos.iter()) {
                        *n = -x;
                    }

                    let problem = SvmProblem::new(&features, 1, 2 * k);
                    match solver.solve(&problem, params) {
                        Ok(w) => {
                            tables.items.write_row(c.winner as usize, &w[..k]);
                            tables.items.write_row(c.loser as usize, &w[k..]);
                        }
                        Err(e) => {
                            debug!(comparison = idx, partition = p, error = %e, "skipping item update");
                            skipped += 1;
                        }
                    }
                }
                skipped
            })
            .sum()
    })
}

/// Run `config.rounds` alternating rounds, evaluating after each one.
pub fn run_alternating(
    ctx: &RunContext,
    partitions: &PartitionAssignment,
    solver: &dyn ConvexSolver,
    config: &AlternatingConfig,
) -> BlockOutcome {
    let params = SolverParams::from(config);
    let start_time = Instant::now();
    let mut outcome = BlockOutcome {
        reports: Vec::with_capacity(config.rounds),
        rounds_completed: 0,
        stopped_early: false,
    };

    info!(
        rounds = config.rounds,
        users = ctx.store.n_users(),
        partitions = partitions.n_parts(),
        c = config.c,
        eps = config.eps,
        "starting alternating rankSVM"
    );

    for round in 1..=config.rounds {
        if ctx.shutdown.load(Ordering::Relaxed) {
            outcome.stopped_early = true;
            break;
        }

        let skipped_users = solve_user_phase(ctx, solver, &params);
        let skipped_items = solve_item_phase(ctx, partitions, solver, &params);

        let metrics = evaluate_all(ctx.evaluators, ctx.tables);
        let train_error = ctx.pool.install(|| test_error(ctx.tables, ctx.store.train()));
        let elapsed = start_time.elapsed().as_secs_f64();
        info!(
            round,
            test_error = ?metrics.test_error,
            ndcg = ?metrics.ndcg,
            train_error,
            skipped_users,
            skipped_items,
            elapsed_secs = elapsed,
            "round finished"
        );
        outcome.reports.push(RoundReport {
            round,
            metrics,
            train_error,
            skipped_users,
            skipped_items,
            elapsed_secs: elapsed,
        });
        outcome.rounds_completed = round;
    }
    outcome
}
