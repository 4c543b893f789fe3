//! Parallel collaborative ranking from pairwise preferences.
//!
//! Two factor tables are fitted so that `U_user · (V_winner − V_loser)` is
//! positive for observed comparisons, either with lock-free SGD over shared
//! tables or with alternating per-user and per-partition SVM solves.

pub mod block;
pub mod comparisons;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod factors;
pub mod partition;
pub mod rng;
pub mod sgd;
pub mod solver;
pub mod trainer;

pub use comparisons::{Comparison, ComparisonStore};
pub use config::{Method, Sampling, TrainConfig};
pub use error::{Error, Result};
pub use evaluate::{BinaryEvaluator, Evaluator, Metrics, PairwiseEvaluator};
pub use factors::FactorTables;
pub use partition::{GreedyGrowth, PartitionAssignment, PartitionOracle};
pub use solver::{ConvexSolver, DualCoordinateDescent};
pub use trainer::{TrainOutcome, Trainer};
