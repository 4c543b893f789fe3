//! Run orchestration: owns the store, the shared tables, the worker pool and
//! the lazily built partition assignment, and dispatches to an engine.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use rayon::ThreadPool;
use serde::Serialize;
use tracing::info;

use crate::block::{run_alternating, BlockOutcome};
use crate::comparisons::ComparisonStore;
use crate::config::{Method, Sampling, TrainConfig};
use crate::error::{Error, Result};
use crate::evaluate::{evaluate_all, Evaluator, Metrics, PairwiseEvaluator};
use crate::factors::FactorTables;
use crate::partition::{GreedyGrowth, PartitionAssignment, PartitionOracle};
use crate::sgd::{run_sgd, SgdOutcome};
use crate::solver::{ConvexSolver, DualCoordinateDescent};

/// Everything an engine reads during a run.
pub struct RunContext<'a> {
    pub store: &'a ComparisonStore,
    pub tables: &'a FactorTables,
    pub evaluators: &'a [Evaluator],
    pub pool: &'a ThreadPool,
    pub seed: u64,
    /// Checked between rounds and at least once per pass during SGD.
    pub shutdown: &'a AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub method: Method,
    pub threads: usize,
    pub seed: u64,
    pub initial_metrics: Metrics,
    pub final_metrics: Metrics,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sgd: Option<SgdOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternating: Option<BlockOutcome>,
}

impl TrainOutcome {
    /// Final pairwise test error, `0.0` when no pairwise evaluator ran.
    pub fn test_error(&self) -> f64 {
        self.final_metrics.test_error.unwrap_or(0.0)
    }
}

pub struct Trainer {
    config: TrainConfig,
    store: ComparisonStore,
    tables: FactorTables,
    evaluators: Vec<Evaluator>,
    pool: ThreadPool,
    n_threads: usize,
    seed: u64,
    partitions: Option<PartitionAssignment>,
    oracle: Box<dyn PartitionOracle>,
    solver: Box<dyn ConvexSolver>,
    shutdown: Arc<AtomicBool>,
}

impl Trainer {
    /// Validate the configuration, build the worker pool and draw the initial
    /// tables. A config without a seed runs with seed 0.
    pub fn new(store: ComparisonStore, config: TrainConfig, n_threads: usize) -> Result<Self> {
        config.validate()?;
        if n_threads == 0 {
            return Err(Error::InvalidConfig("number of threads must be at least 1".into()));
        }
        if store.train().is_empty() {
            return Err(Error::EmptyInput("no training comparisons".into()));
        }

        let seed = config.seed.unwrap_or(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("collrank-{i}"))
            .build()?;
        let tables = FactorTables::random(store.n_users(), store.n_items(), config.rank, seed);
        let evaluators = vec![Evaluator::Pairwise(PairwiseEvaluator {
            test: store.test().to_vec(),
            ndcg_k: config.evaluation.ndcg_k,
        })];

        info!(
            users = store.n_users(),
            items = store.n_items(),
            train = store.train().len(),
            test = store.test().len(),
            rank = config.rank,
            threads = n_threads,
            seed,
            "trainer ready"
        );

        Ok(Self {
            oracle: Box::new(GreedyGrowth { seed }),
            solver: Box::new(DualCoordinateDescent),
            config,
            store,
            tables,
            evaluators,
            pool,
            n_threads,
            seed,
            partitions: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Add an evaluator. Fails if it references ids the tables do not hold.
    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Result<Self> {
        evaluator.check_bounds(self.store.n_users(), self.store.n_items())?;
        self.evaluators.push(evaluator);
        Ok(self)
    }

    pub fn with_oracle(mut self, oracle: Box<dyn PartitionOracle>) -> Self {
        self.oracle = oracle;
        self.partitions = None;
        self
    }

    pub fn with_solver(mut self, solver: Box<dyn ConvexSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Flag that stops a running engine at its next check.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn store(&self) -> &ComparisonStore {
        &self.store
    }

    pub fn tables(&self) -> &FactorTables {
        &self.tables
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Redraw both tables from `seed`.
    pub fn reinitialize(&mut self, seed: u64) {
        self.seed = seed;
        self.tables.reinitialize(seed);
    }

    /// Partition assignment for the configured partition count, built on first use.
    pub fn partitions(&mut self) -> Result<&PartitionAssignment> {
        if self.partitions.is_none() {
            let n_parts = self.config.partitions_for(self.n_threads);
            let built = PartitionAssignment::build(
                self.store.train(),
                self.store.n_items(),
                n_parts,
                self.oracle.as_ref(),
            )?;
            self.partitions = Some(built);
        }
        self.partitions
            .as_ref()
            .ok_or_else(|| Error::Partition("partition assignment missing".into()))
    }

    /// Score the current tables with every evaluator.
    pub fn evaluate(&self) -> Metrics {
        self.pool.install(|| evaluate_all(&self.evaluators, &self.tables))
    }

    /// Run the configured method to completion or until shutdown.
    pub fn train(&mut self) -> Result<TrainOutcome> {
        let method = self.config.method;
        let needs_partitions = method == Method::Alternating
            || self.config.sgd.sampling == Sampling::Partitioned;
        if needs_partitions {
            self.partitions()?;
        }

        let initial_metrics = self.evaluate();
        info!(
            method = ?method,
            test_error = ?initial_metrics.test_error,
            ndcg = ?initial_metrics.ndcg,
            "initial evaluation"
        );

        let start = Instant::now();
        let ctx = RunContext {
            store: &self.store,
            tables: &self.tables,
            evaluators: &self.evaluators,
            pool: &self.pool,
            seed: self.seed,
            shutdown: &self.shutdown,
        };

        let (sgd, alternating) = match method {
            Method::Sgd => (
                Some(run_sgd(&ctx, self.partitions.as_ref(), &self.config.sgd)),
                None,
            ),
            Method::Alternating => {
                let partitions = self
                    .partitions
                    .as_ref()
                    .ok_or_else(|| Error::Partition("partition assignment missing".into()))?;
                let outcome =
                    run_alternating(&ctx, partitions, self.solver.as_ref(), &self.config.alternating);
                (None, Some(outcome))
            }
        };
        let elapsed_secs = start.elapsed().as_secs_f64();

        let final_metrics = self.evaluate();
        info!(
            test_error = ?final_metrics.test_error,
            ndcg = ?final_metrics.ndcg,
            elapsed_secs,
            "training finished"
        );

        Ok(TrainOutcome {
            method,
            threads: self.n_threads,
            seed: self.seed,
            initial_metrics,
            final_metrics,
            elapsed_secs,
            sgd,
            alternating,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::comparisons::Comparison;
    use crate::partition::ItemGraph;

    fn small_store() -> ComparisonStore {
        ComparisonStore::from_comparisons(
            vec![
                Comparison::new(0, 0, 1),
                Comparison::new(0, 1, 2),
                Comparison::new(1, 2, 3),
                Comparison::new(2, 3, 0),
            ],
            vec![Comparison::new(0, 0, 2)],
        )
    }

    fn config(method: Method) -> TrainConfig {
        TrainConfig {
            method,
            rank: 2,
            seed: Some(3),
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_rejects_zero_threads_and_empty_input() {
        assert!(matches!(
            Trainer::new(small_store(), config(Method::Sgd), 0),
            Err(Error::InvalidConfig(_))
        ));
        let empty = ComparisonStore::from_comparisons(vec![], vec![Comparison::new(0, 0, 1)]);
        assert!(matches!(
            Trainer::new(empty, config(Method::Sgd), 2),
            Err(Error::EmptyInput(_))
        ));
    }

    #[test]
    fn test_partitions_are_cached() {
        let mut trainer = Trainer::new(small_store(), config(Method::Alternating), 2).unwrap();
        let first = trainer.partitions().unwrap().sizes();
        assert_eq!(first.len(), 3);
        assert_eq!(first.iter().sum::<usize>(), 4);
        let second = trainer.partitions().unwrap().sizes();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_oracle_surfaces_as_error() {
        struct Empty;
        impl PartitionOracle for Empty {
            fn label_items(&self, _graph: &ItemGraph, _n_parts: usize) -> Vec<usize> {
                Vec::new()
            }
        }
        let mut trainer = Trainer::new(small_store(), config(Method::Alternating), 1)
            .unwrap()
            .with_oracle(Box::new(Empty));
        assert!(matches!(trainer.train(), Err(Error::Partition(_))));
    }

    #[test]
    fn test_out_of_range_evaluator_is_rejected() {
        let trainer = Trainer::new(small_store(), config(Method::Sgd), 1).unwrap();
        // the store holds 3 users and 4 items
        let evaluator = Evaluator::Pairwise(PairwiseEvaluator {
            test: vec![Comparison::new(0, 1, 4)],
            ndcg_k: 10,
        });
        assert!(matches!(
            trainer.with_evaluator(evaluator),
            Err(Error::InvalidConfig(_))
        ));

        let trainer = Trainer::new(small_store(), config(Method::Sgd), 1).unwrap();
        let evaluator = Evaluator::Pairwise(PairwiseEvaluator {
            test: vec![Comparison::new(2, 3, 0)],
            ndcg_k: 10,
        });
        let mut trainer = trainer.with_evaluator(evaluator).unwrap();
        assert!(trainer.train().is_ok());
    }

    #[test]
    fn test_sgd_run_reports_outcome() {
        let mut trainer = Trainer::new(small_store(), config(Method::Sgd), 2).unwrap();
        let outcome = trainer.train().unwrap();
        assert_eq!(outcome.threads, 2);
        assert_eq!(outcome.seed, 3);
        assert!(outcome.alternating.is_none());
        let sgd = outcome.sgd.unwrap();
        assert_eq!(sgd.iterations_per_worker, 4 * 100 / 2);
        assert_eq!(sgd.updates + sgd.satisfied, 2 * 200);
        assert!(!sgd.stopped_early);
        // worker 0 reports every 20 of its 200 iterations
        assert_eq!(sgd.reports.len(), 10);
    }

    #[test]
    fn test_alternating_run_reports_rounds() {
        let mut cfg = config(Method::Alternating);
        cfg.alternating.rounds = 4;
        let mut trainer = Trainer::new(small_store(), cfg, 2).unwrap();
        let outcome = trainer.train().unwrap();
        assert!(outcome.sgd.is_none());
        let alt = outcome.alternating.unwrap();
        assert_eq!(alt.rounds_completed, 4);
        assert_eq!(alt.reports.len(), 4);
    }

    #[test]
    fn test_shutdown_stops_sgd_at_first_check() {
        let mut trainer = Trainer::new(small_store(), config(Method::Sgd), 1).unwrap();
        trainer.shutdown_handle().store(true, Ordering::Relaxed);
        let sgd = trainer.train().unwrap().sgd.unwrap();
        assert!(sgd.stopped_early);
        assert!(sgd.reports.is_empty());
        // polled every min(40, 4) iterations
        assert_eq!(sgd.updates + sgd.satisfied, 4);
    }

    #[test]
    fn test_same_seed_single_thread_is_reproducible() {
        let run = || {
            let mut trainer = Trainer::new(small_store(), config(Method::Sgd), 1).unwrap();
            trainer.train().unwrap();
            (trainer.tables().users.to_vec(), trainer.tables().items.to_vec())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_reinitialize_redraws_tables() {
        let mut trainer = Trainer::new(small_store(), config(Method::Sgd), 1).unwrap();
        let before = trainer.tables().users.to_vec();
        trainer.reinitialize(99);
        assert_eq!(trainer.seed(), 99);
        assert_ne!(before, trainer.tables().users.to_vec());
        assert_eq!(
            trainer.tables().users.to_vec(),
            FactorTables::random(3, 4, 2, 99).users.to_vec()
        );
    }
}
