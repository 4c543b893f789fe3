//! Convex sub-solver for the alternating engine.
//!
//! Every subproblem is a linear SVM whose rows all carry the label +1
//! ("the first item is preferred"). The default solver is dual coordinate
//! descent for the L2-regularized squared-hinge loss, visiting coordinates in
//! a fixed order so identical inputs give identical weights.

use thiserror::Error;

/// Reasons a subproblem is refused. The caller skips the update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("problem has no rows")]
    EmptyProblem,

    #[error("problem has no features")]
    NoFeatures,

    #[error("feature block holds {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("non-finite feature in row {row}")]
    NonFiniteFeature { row: usize },

    #[error("C must be positive and finite, got {0}")]
    InvalidCost(f64),

    #[error("eps must be positive and finite, got {0}")]
    InvalidTolerance(f64),
}

/// Which loss the solver optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    /// L2-regularized L2-loss SVM, solved in the dual.
    L2LossSvcDual,
}

#[derive(Debug, Clone, Copy)]
pub struct SolverParams {
    pub kind: SolverKind,
    pub c: f64,
    pub eps: f64,
    pub max_iter: usize,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            kind: SolverKind::L2LossSvcDual,
            c: 1.0,
            eps: 1e-8,
            max_iter: 1000,
        }
    }
}

/// Row-major `n_rows × n_features` block; every row is labelled +1.
#[derive(Debug, Clone, Copy)]
pub struct SvmProblem<'a> {
    pub features: &'a [f64],
    pub n_rows: usize,
    pub n_features: usize,
}

impl<'a> SvmProblem<'a> {
    pub fn new(features: &'a [f64], n_rows: usize, n_features: usize) -> Self {
        Self {
            features,
            n_rows,
            n_features,
        }
    }

    #[inline(always)]
    fn row(&self, i: usize) -> &'a [f64] {
        &self.features[i * self.n_features..(i + 1) * self.n_features]
    }
}

/// Validate a problem and its parameters before solving.
pub fn check_parameter(problem: &SvmProblem, params: &SolverParams) -> Result<(), SolverError> {
    if problem.n_rows == 0 {
        return Err(SolverError::EmptyProblem);
    }
    if problem.n_features == 0 {
        return Err(SolverError::NoFeatures);
    }
    let expected = problem.n_rows * problem.n_features;
    if problem.features.len() != expected {
        return Err(SolverError::ShapeMismatch {
            expected,
            actual: problem.features.len(),
        });
    }
    if let Some(row) = (0..problem.n_rows).find(|&i| problem.row(i).iter().any(|v| !v.is_finite()))
    {
        return Err(SolverError::NonFiniteFeature { row });
    }
    if !(params.c > 0.0 && params.c.is_finite()) {
        return Err(SolverError::InvalidCost(params.c));
    }
    if !(params.eps > 0.0 && params.eps.is_finite()) {
        return Err(SolverError::InvalidTolerance(params.eps));
    }
    Ok(())
}

/// A convex solver returning a weight vector of length `n_features`.
pub trait ConvexSolver: Sync {
    fn solve(&self, problem: &SvmProblem, params: &SolverParams) -> Result<Vec<f64>, SolverError>;
}

/// Dual coordinate descent (Hsieh et al., 2008) for the squared-hinge SVM
/// without bias term.
#[derive(Debug, Clone, Copy, Default)]
pub struct DualCoordinateDescent;

impl ConvexSolver for DualCoordinateDescent {
    fn solve(&self, problem: &SvmProblem, params: &SolverParams) -> Result<Vec<f64>, SolverError> {
        check_parameter(problem, params)?;
        match params.kind {
            SolverKind::L2LossSvcDual => Ok(l2loss_svc_dual(problem, params)),
        }
    }
}

fn l2loss_svc_dual(problem: &SvmProblem, params: &SolverParams) -> Vec<f64> {
    let l = problem.n_rows;
    let n = problem.n_features;
    // squared hinge: no upper bound on alpha, diagonal shift 1/(2C)
    let diag = 0.5 / params.c;

    let mut w = vec![0.0f64; n];
    let mut alpha = vec![0.0f64; l];
    let qd: Vec<f64> = (0..l)
        .map(|i| {
            let x = problem.row(i);
            diag + x.iter().map(|v| v * v).sum::<f64>()
        })
        .collect();

    for _ in 0..params.max_iter {
        let mut pg_max = f64::NEG_INFINITY;
        let mut pg_min = f64::INFINITY;

        for i in 0..l {
            let x = problem.row(i);
            let wx: f64 = w.iter().zip(x).map(|(a, b)| a * b).sum();
            let g = wx - 1.0 + diag * alpha[i];

            let pg = if alpha[i] == 0.0 { g.min(0.0) } else { g };
            pg_max = pg_max.max(pg);
            pg_min = pg_min.min(pg);

            if pg.abs() > 1e-12 {
                let old = alpha[i];
                alpha[i] = (old - g / qd[i]).max(0.0);
                let d = alpha[i] - old;
                for (wj, xj) in w.iter_mut().zip(x) {
                    *wj += d * xj;
                }
            }
        }

        if pg_max - pg_min <= params.eps {
            break;
        }
    }
    w
}
