//! Conflict partitioning of training comparisons.
//!
//! Comparisons that share an item write the same row of the item table. The
//! partitioner clusters the item co-occurrence graph and lets every comparison
//! inherit its winner's cluster, so workers that stay inside one partition
//! rarely collide. Partitions are a scheduling hint only; nothing enforces
//! them at write time.

use std::collections::VecDeque;

use ahash::AHashSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::comparisons::Comparison;
use crate::error::{Error, Result};

/// Undirected item adjacency in CSR form. Items are adjacent when some
/// comparison involves both.
#[derive(Debug, Clone)]
pub struct ItemGraph {
    indptr: Vec<usize>,
    neighbors: Vec<u32>,
}

impl ItemGraph {
    pub fn from_comparisons(comparisons: &[Comparison], n_items: usize) -> Self {
        let mut adjacency: Vec<AHashSet<u32>> = vec![AHashSet::new(); n_items];
        for c in comparisons {
            adjacency[c.winner as usize].insert(c.loser);
            adjacency[c.loser as usize].insert(c.winner);
        }

        let mut indptr = Vec::with_capacity(n_items + 1);
        indptr.push(0);
        let mut neighbors = Vec::new();
        for set in adjacency {
            let mut row: Vec<u32> = set.into_iter().collect();
            row.sort_unstable();
            neighbors.extend_from_slice(&row);
            indptr.push(neighbors.len());
        }
        Self { indptr, neighbors }
    }

    pub fn n_items(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn neighbors(&self, item: usize) -> &[u32] {
        &self.neighbors[self.indptr[item]..self.indptr[item + 1]]
    }

    pub fn degree(&self, item: usize) -> usize {
        self.indptr[item + 1] - self.indptr[item]
    }

    pub fn n_edges(&self) -> usize {
        self.neighbors.len() / 2
    }
}

/// Graph clustering oracle: one label in `[0, n_parts)` per item.
///
/// Implementations need not be deterministic or balanced.
pub trait PartitionOracle: Sync {
    fn label_items(&self, graph: &ItemGraph, n_parts: usize) -> Vec<usize>;
}

/// Breadth-first region growing.
///
/// Seeds are visited in a shuffled order; each part is grown from its seed
/// until it holds `ceil(active / n_parts)` items, then the next part starts.
/// The last part absorbs whatever is left. Items without neighbors are dealt
/// round-robin since they cannot conflict with anything.
#[derive(Debug, Clone, Copy)]
pub struct GreedyGrowth {
    pub seed: u64,
}

impl PartitionOracle for GreedyGrowth {
    fn label_items(&self, graph: &ItemGraph, n_parts: usize) -> Vec<usize> {
        let n_items = graph.n_items();
        let mut labels = vec![usize::MAX; n_items];
        if n_parts == 0 {
            return labels;
        }

        let mut isolated = 0usize;
        for item in 0..n_items {
            if graph.degree(item) == 0 {
                labels[item] = isolated % n_parts;
                isolated += 1;
            }
        }

        let active = n_items - isolated;
        let target = active.div_ceil(n_parts).max(1);

        let mut seeds: Vec<usize> = (0..n_items).filter(|&i| graph.degree(i) > 0).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        seeds.shuffle(&mut rng);

        let mut part = 0usize;
        let mut filled = 0usize;
        let mut queue = VecDeque::new();
        for seed in seeds {
            if labels[seed] != usize::MAX {
                continue;
            }
            queue.clear();
            queue.push_back(seed);
            labels[seed] = part;
            filled += 1;

            while let Some(item) = queue.pop_front() {
                if filled >= target && part + 1 < n_parts {
                    break;
                }
                for &nb in graph.neighbors(item) {
                    let nb = nb as usize;
                    if labels[nb] != usize::MAX {
                        continue;
                    }
                    if filled >= target && part + 1 < n_parts {
                        break;
                    }
                    labels[nb] = part;
                    filled += 1;
                    queue.push_back(nb);
                }
            }

            if filled >= target && part + 1 < n_parts {
                part += 1;
                filled = 0;
            }
        }
        labels
    }
}

/// Partition id per training comparison plus the grouping per partition.
#[derive(Debug, Clone)]
pub struct PartitionAssignment {
    n_parts: usize,
    labels: Vec<u32>,
    item_labels: Vec<usize>,
    indptr: Vec<usize>,
    order: Vec<usize>,
}

impl PartitionAssignment {
    pub fn build(
        train: &[Comparison],
        n_items: usize,
        n_parts: usize,
        oracle: &dyn PartitionOracle,
    ) -> Result<Self> {
        if n_parts == 0 {
            return Err(Error::InvalidConfig("number of partitions must be at least 1".into()));
        }

        let graph = ItemGraph::from_comparisons(train, n_items);
        let item_labels = oracle.label_items(&graph, n_parts);
        if item_labels.len() != n_items {
            return Err(Error::Partition(format!(
                "expected {n_items} item labels, got {}",
                item_labels.len()
            )));
        }
        if let Some((item, &label)) = item_labels.iter().enumerate().find(|(_, l)| **l >= n_parts) {
            return Err(Error::Partition(format!(
                "item {item} labelled {label}, outside [0, {n_parts})"
            )));
        }

        let labels: Vec<u32> = train
            .iter()
            .map(|c| item_labels[c.winner as usize] as u32)
            .collect();

        let mut counts = vec![0usize; n_parts];
        for &l in &labels {
            counts[l as usize] += 1;
        }
        let mut indptr = vec![0usize; n_parts + 1];
        for p in 0..n_parts {
            indptr[p + 1] = indptr[p] + counts[p];
        }
        let mut order = vec![0usize; train.len()];
        let mut pos = indptr[..n_parts].to_vec();
        for (idx, &l) in labels.iter().enumerate() {
            order[pos[l as usize]] = idx;
            pos[l as usize] += 1;
        }

        let assignment = Self {
            n_parts,
            labels,
            item_labels,
            indptr,
            order,
        };
        info!(
            parts = n_parts,
            edges = graph.n_edges(),
            cut = assignment.cut_fraction(train),
            sizes = ?assignment.sizes(),
            "partitioned training comparisons"
        );
        Ok(assignment)
    }

    pub fn n_parts(&self) -> usize {
        self.n_parts
    }

    /// Partition of training comparison `idx`.
    pub fn label(&self, idx: usize) -> usize {
        self.labels[idx] as usize
    }

    /// Indices of the training comparisons in partition `p`, in file order.
    pub fn group(&self, p: usize) -> &[usize] {
        &self.order[self.indptr[p]..self.indptr[p + 1]]
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.indptr.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Fraction of comparisons whose loser sits in another part than the winner.
    /// `train` must be the sequence the assignment was built from.
    pub fn cut_fraction(&self, train: &[Comparison]) -> f64 {
        if train.is_empty() {
            return 0.0;
        }
        let labels = &self.item_labels;
        let cut = train
            .iter()
            .filter(|c| labels[c.winner as usize] != labels[c.loser as usize])
            .count();
        cut as f64 / train.len() as f64
    }
}
