//! Read-only scoring passes over the shared factor tables.
//!
//! Evaluators read the tables while workers may still be writing them and
//! make no attempt to get a consistent snapshot.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::comparisons::Comparison;
use crate::error::{Error, Result};
use crate::factors::FactorTables;

/// Fraction of comparisons the model orders wrongly (margin `<= 0`).
///
/// Returns exactly `1.0` as soon as any margin is not finite, and `0.0` for an
/// empty set.
pub fn test_error(tables: &FactorTables, comparisons: &[Comparison]) -> f64 {
    if comparisons.is_empty() {
        return 0.0;
    }
    let errors = comparisons
        .par_iter()
        .map(|c| tables.margin(c.user as usize, c.winner as usize, c.loser as usize))
        .try_fold(
            || 0usize,
            |acc, m| {
                if !m.is_finite() {
                    None
                } else {
                    Some(acc + usize::from(m <= 0.0))
                }
            },
        )
        .try_reduce(|| 0, |a, b| Some(a + b));

    match errors {
        Some(n) => n as f64 / comparisons.len() as f64,
        None => {
            warn!("non-finite prediction detected, reporting worst-case test error");
            1.0
        }
    }
}

#[inline]
fn discount(rank: usize) -> f64 {
    1.0 / (2.0 + rank as f64).log2()
}

#[inline]
fn gain(rel: u32) -> f64 {
    2f64.powi(rel as i32) - 1.0
}

/// Mean NDCG@k over users with test comparisons.
///
/// A user's candidates are the items of their test comparisons; an item's
/// relevance is how many of those comparisons it wins. Candidates are ranked
/// by `U_u · V_i`. Users whose ideal DCG is zero are skipped. `None` when no
/// user qualifies or a score is not finite.
pub fn ndcg_at_k(tables: &FactorTables, comparisons: &[Comparison], k: usize) -> Option<f64> {
    if k == 0 {
        return None;
    }

    let mut by_user: AHashMap<u32, AHashMap<u32, u32>> = AHashMap::new();
    for c in comparisons {
        let items = by_user.entry(c.user).or_default();
        *items.entry(c.winner).or_insert(0) += 1;
        items.entry(c.loser).or_insert(0);
    }
    let mut users: Vec<u32> = by_user.keys().copied().collect();
    users.sort_unstable();

    let per_user: Vec<Option<Option<f64>>> = users
        .par_iter()
        .map(|u| {
            let items = &by_user[u];
            let mut scored = Vec::with_capacity(items.len());
            for (&item, &rel) in items {
                let s = tables.score(*u as usize, item as usize);
                if !s.is_finite() {
                    return None;
                }
                scored.push((s, item, rel));
            }
            // ties broken by item id so repeated passes agree
            scored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            let dcg: f64 = scored
                .iter()
                .take(k)
                .enumerate()
                .map(|(r, &(_, _, rel))| gain(rel) * discount(r))
                .sum();

            let mut ideal: Vec<u32> = items.values().copied().collect();
            ideal.sort_unstable_by(|a, b| b.cmp(a));
            let idcg: f64 = ideal
                .iter()
                .take(k)
                .enumerate()
                .map(|(r, &rel)| gain(rel) * discount(r))
                .sum();

            Some(if idcg > 0.0 { Some(dcg / idcg) } else { None })
        })
        .collect();

    let mut sum = 0.0;
    let mut n = 0usize;
    for v in per_user {
        match v {
            None => {
                warn!("non-finite score detected, NDCG unavailable");
                return None;
            }
            Some(Some(x)) => {
                sum += x;
                n += 1;
            }
            Some(None) => {}
        }
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Top-`n` unseen items for `user`, best first. `None` if any candidate
/// score is not finite.
fn top_n_items(
    tables: &FactorTables,
    user: usize,
    n: usize,
    seen: Option<&AHashSet<u32>>,
) -> Option<Vec<u32>> {
    let n_items = tables.items.rows();
    let mut scored: Vec<(f64, u32)> = Vec::with_capacity(n_items);
    for i in 0..n_items as u32 {
        if seen.is_some_and(|s| s.contains(&i)) {
            continue;
        }
        let s = tables.score(user, i as usize);
        if !s.is_finite() {
            return None;
        }
        scored.push((s, i));
    }
    let take = n.min(scored.len());
    if take == 0 {
        return Some(Vec::new());
    }
    scored.select_nth_unstable_by(take - 1, |a, b| b.0.total_cmp(&a.0));
    scored.truncate(take);
    scored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    Some(scored.into_iter().map(|(_, i)| i).collect())
}

/// Precision at each cutoff in `ks`, averaged over all users of the model.
///
/// Users without held-out items contribute zero hits. Items the user already
/// interacted with in `train` are never recommended. A non-finite score for
/// any evaluated user yields all zeros.
pub fn precision_at_k(
    tables: &FactorTables,
    train: &AHashMap<u32, AHashSet<u32>>,
    test: &AHashMap<u32, AHashSet<u32>>,
    ks: &[usize],
) -> Vec<f64> {
    let n_users = tables.users.rows();
    let max_k = ks.iter().copied().max().unwrap_or(0);
    let mut users: Vec<u32> = test
        .keys()
        .copied()
        .filter(|&u| (u as usize) < tables.users.rows())
        .collect();
    users.sort_unstable();
    if users.is_empty() || max_k == 0 {
        return vec![0.0; ks.len()];
    }

    let hits: Option<Vec<Vec<usize>>> = users
        .par_iter()
        .map(|&u| {
            let top = top_n_items(tables, u as usize, max_k, train.get(&u))?;
            let relevant = &test[&u];
            Some(
                ks.iter()
                    .map(|&k| top.iter().take(k).filter(|i| relevant.contains(i)).count())
                    .collect(),
            )
        })
        .collect();
    let Some(hits) = hits else {
        warn!("non-finite score detected, precision reported as zero");
        return vec![0.0; ks.len()];
    };

    ks.iter()
        .enumerate()
        .map(|(j, &k)| {
            if k == 0 {
                return 0.0;
            }
            let total: usize = hits.iter().map(|h| h[j]).sum();
            total as f64 / (n_users * k) as f64
        })
        .collect()
}

/// Scores reported by an evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_error: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ndcg: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub precision_at_k: Vec<(usize, f64)>,
}

/// Held-out pairwise comparisons.
#[derive(Debug, Clone)]
pub struct PairwiseEvaluator {
    pub test: Vec<Comparison>,
    pub ndcg_k: usize,
}

/// Held-out implicit `(user, item)` interactions.
#[derive(Debug, Clone)]
pub struct BinaryEvaluator {
    pub train: AHashMap<u32, AHashSet<u32>>,
    pub test: AHashMap<u32, AHashSet<u32>>,
    pub ks: Vec<usize>,
}

impl BinaryEvaluator {
    /// Read `user item` lines with 1-based ids from both files.
    pub fn load(train_path: &Path, test_path: &Path, ks: Vec<usize>) -> Result<Self> {
        Ok(Self {
            train: read_pairs(train_path)?,
            test: read_pairs(test_path)?,
            ks,
        })
    }
}

fn read_pairs(path: &Path) -> Result<AHashMap<u32, AHashSet<u32>>> {
    let io_err = |e: std::io::Error| Error::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut out: AHashMap<u32, AHashSet<u32>> = AHashMap::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split_whitespace().map(str::parse::<u32>);
        match (fields.next(), fields.next()) {
            (Some(Ok(u)), Some(Ok(i))) if u > 0 && i > 0 => {
                out.entry(u - 1).or_default().insert(i - 1);
            }
            _ => {
                return Err(Error::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: format!("expected \"user item\" with 1-based ids, got \"{trimmed}\""),
                })
            }
        }
    }
    Ok(out)
}

/// One evaluation mode per variant.
#[derive(Debug, Clone)]
pub enum Evaluator {
    Pairwise(PairwiseEvaluator),
    Binary(BinaryEvaluator),
}

impl Evaluator {
    /// Reject held-out comparisons that index past the model's tables.
    /// Implicit data needs no check: unknown users and items never score.
    pub fn check_bounds(&self, n_users: usize, n_items: usize) -> Result<()> {
        let Evaluator::Pairwise(e) = self else {
            return Ok(());
        };
        let out_of_range = e.test.iter().find(|c| {
            c.user as usize >= n_users
                || c.winner as usize >= n_items
                || c.loser as usize >= n_items
        });
        match out_of_range {
            Some(c) => Err(Error::InvalidConfig(format!(
                "evaluator comparison ({}, {}, {}) outside {n_users} users and {n_items} items",
                c.user + 1,
                c.winner + 1,
                c.loser + 1
            ))),
            None => Ok(()),
        }
    }

    pub fn evaluate(&self, tables: &FactorTables) -> Metrics {
        match self {
            Evaluator::Pairwise(e) => Metrics {
                test_error: Some(test_error(tables, &e.test)),
                ndcg: ndcg_at_k(tables, &e.test, e.ndcg_k),
                precision_at_k: Vec::new(),
            },
            Evaluator::Binary(e) => Metrics {
                test_error: None,
                ndcg: None,
                precision_at_k: e
                    .ks
                    .iter()
                    .copied()
                    .zip(precision_at_k(tables, &e.train, &e.test, &e.ks))
                    .collect(),
            },
        }
    }
}

/// Evaluate with every evaluator and merge the non-empty fields.
pub fn evaluate_all(evaluators: &[Evaluator], tables: &FactorTables) -> Metrics {
    let mut merged = Metrics::default();
    for e in evaluators {
        let m = e.evaluate(tables);
        merged.test_error = merged.test_error.or(m.test_error);
        merged.ndcg = merged.ndcg.or(m.ndcg);
        merged.precision_at_k.extend(m.precision_at_k);
    }
    merged
}
