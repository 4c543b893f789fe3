//! Run configuration.
//!
//! Loaded from a TOML file; every field is optional and falls back to the
//! defaults below. Command-line flags override file values.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Optimization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Lock-free stochastic gradient descent.
    #[default]
    Sgd,
    /// Alternating rankSVM: per-user and per-partition convex solves.
    Alternating,
}

/// Where SGD workers draw their samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Sampling {
    /// Every worker samples the whole training set.
    #[default]
    Uniform,
    /// Worker `w` samples partition `w mod P`.
    Partitioned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SgdConfig {
    /// Initial step size.
    pub alpha: f64,
    /// Step decay: `alpha / (1 + beta * t)`.
    pub beta: f64,
    /// L2 regularization, divided by each entity's comparison count.
    pub lambda: f64,
    /// Passes over the training set, summed over all workers.
    pub epochs: usize,
    /// Evaluate every this many epochs' worth of worker 0's iterations.
    pub report_every: usize,
    pub sampling: Sampling,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            beta: 0.001,
            lambda: 0.1,
            epochs: 100,
            report_every: 10,
            sampling: Sampling::Uniform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlternatingConfig {
    pub rounds: usize,
    /// SVM cost parameter of every subproblem.
    pub c: f64,
    /// Solver stopping tolerance.
    pub eps: f64,
    pub max_solver_iter: usize,
}

impl Default for AlternatingConfig {
    fn default() -> Self {
        Self {
            rounds: 20,
            c: 1.0,
            eps: 1e-8,
            max_solver_iter: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationConfig {
    pub ndcg_k: usize,
    /// Cutoffs for precision on implicit held-out data.
    pub precision_k: Vec<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            ndcg_k: 10,
            precision_k: vec![1, 5, 10],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub method: Method,
    /// Latent dimension of user and item vectors.
    pub rank: usize,
    /// Run seed. `None` lets the caller pick one.
    pub seed: Option<u64>,
    /// Number of conflict partitions. Defaults to `threads + 1`.
    pub partitions: Option<usize>,
    pub sgd: SgdConfig,
    pub alternating: AlternatingConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            method: Method::Sgd,
            rank: 10,
            seed: None,
            partitions: None,
            sgd: SgdConfig::default(),
            alternating: AlternatingConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load a config file. The file must exist; callers that want defaults
    /// use `TrainConfig::default()` instead.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Partition count for a run on `threads` workers.
    pub fn partitions_for(&self, threads: usize) -> usize {
        self.partitions.unwrap_or(threads + 1)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidConfig(msg));
        if self.rank == 0 {
            return bad("rank must be at least 1".into());
        }
        if self.partitions == Some(0) {
            return bad("partitions must be at least 1".into());
        }
        let sgd = &self.sgd;
        if !(sgd.alpha > 0.0 && sgd.alpha.is_finite()) {
            return bad(format!("sgd.alpha must be positive, got {}", sgd.alpha));
        }
        if !(sgd.beta >= 0.0 && sgd.beta.is_finite()) {
            return bad(format!("sgd.beta must be non-negative, got {}", sgd.beta));
        }
        if !(sgd.lambda >= 0.0 && sgd.lambda.is_finite()) {
            return bad(format!("sgd.lambda must be non-negative, got {}", sgd.lambda));
        }
        if sgd.report_every == 0 {
            return bad("sgd.report_every must be at least 1".into());
        }
        let alt = &self.alternating;
        if !(alt.c > 0.0 && alt.c.is_finite()) {
            return bad(format!("alternating.c must be positive, got {}", alt.c));
        }
        if !(alt.eps > 0.0 && alt.eps.is_finite()) {
            return bad(format!("alternating.eps must be positive, got {}", alt.eps));
        }
        if alt.max_solver_iter == 0 {
            return bad("alternating.max_solver_iter must be at least 1".into());
        }
        Ok(())
    }
}
