//! Shared dense factor tables.
//!
//! Components are `f64` values stored as bits in `AtomicU64` cells and only
//! ever touched with relaxed loads and stores. A row update is therefore a
//! plain read-modify-write with no ordering against other threads: concurrent
//! updates to the same row interleave component by component and the last
//! store wins. Readers may observe a row half way through someone else's
//! update.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::rng::XorShift64;

/// Dense row-major `rows × rank` matrix shareable across worker threads.
#[derive(Debug)]
pub struct FactorTable {
    rows: usize,
    rank: usize,
    cells: Box<[AtomicU64]>,
}

impl FactorTable {
    pub fn zeros(rows: usize, rank: usize) -> Self {
        let cells = (0..rows * rank)
            .map(|_| AtomicU64::new(0.0f64.to_bits()))
            .collect();
        Self { rows, rank, cells }
    }

    pub fn from_row_major(rows: usize, rank: usize, values: &[f64]) -> Result<Self> {
        if values.len() != rows * rank {
            return Err(Error::InvalidConfig(format!(
                "factor table of {rows}x{rank} needs {} values, got {}",
                rows * rank,
                values.len()
            )));
        }
        let cells = values.iter().map(|v| AtomicU64::new(v.to_bits())).collect();
        Ok(Self { rows, rank, cells })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline(always)]
    pub fn get(&self, row: usize, k: usize) -> f64 {
        f64::from_bits(self.cells[row * self.rank + k].load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set(&self, row: usize, k: usize, value: f64) {
        self.cells[row * self.rank + k].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Copy row `row` into `out` (length `rank`).
    #[inline(always)]
    pub fn read_row(&self, row: usize, out: &mut [f64]) {
        let base = row * self.rank;
        for (k, o) in out.iter_mut().enumerate().take(self.rank) {
            *o = f64::from_bits(self.cells[base + k].load(Ordering::Relaxed));
        }
    }

    /// Overwrite row `row` with `values` (length `rank`).
    #[inline(always)]
    pub fn write_row(&self, row: usize, values: &[f64]) {
        let base = row * self.rank;
        for (k, v) in values.iter().enumerate().take(self.rank) {
            self.cells[base + k].store(v.to_bits(), Ordering::Relaxed);
        }
    }

    /// Fill with independent uniform draws in `[0, 1)`.
    pub fn fill_uniform(&self, rng: &mut XorShift64) {
        for cell in self.cells.iter() {
            cell.store(rng.next_f64().to_bits(), Ordering::Relaxed);
        }
    }

    /// Row-major copy of the current contents.
    pub fn to_vec(&self) -> Vec<f64> {
        self.cells
            .iter()
            .map(|c| f64::from_bits(c.load(Ordering::Relaxed)))
            .collect()
    }
}

/// User factors `U` and item factors `V` of one model.
#[derive(Debug)]
pub struct FactorTables {
    pub users: FactorTable,
    pub items: FactorTable,
}

impl FactorTables {
    pub fn zeros(n_users: usize, n_items: usize, rank: usize) -> Self {
        Self {
            users: FactorTable::zeros(n_users, rank),
            items: FactorTable::zeros(n_items, rank),
        }
    }

    /// Tables filled uniformly in `[0, 1)`; users from `seed`, items from `seed + 1`.
    pub fn random(n_users: usize, n_items: usize, rank: usize, seed: u64) -> Self {
        let tables = Self::zeros(n_users, n_items, rank);
        tables.reinitialize(seed);
        tables
    }

    pub fn from_row_major(
        n_users: usize,
        n_items: usize,
        rank: usize,
        users: &[f64],
        items: &[f64],
    ) -> Result<Self> {
        Ok(Self {
            users: FactorTable::from_row_major(n_users, rank, users)?,
            items: FactorTable::from_row_major(n_items, rank, items)?,
        })
    }

    /// Redraw every component from a fresh seed.
    pub fn reinitialize(&self, seed: u64) {
        self.users.fill_uniform(&mut XorShift64::new(seed));
        self.items.fill_uniform(&mut XorShift64::new(seed.wrapping_add(1)));
    }

    pub fn rank(&self) -> usize {
        self.users.rank()
    }

    /// `U_user · V_item`.
    #[inline]
    pub fn score(&self, user: usize, item: usize) -> f64 {
        let mut s = 0.0;
        for k in 0..self.rank() {
            s += self.users.get(user, k) * self.items.get(item, k);
        }
        s
    }

    /// `U_user · (V_winner − V_loser)`.
    #[inline]
    pub fn margin(&self, user: usize, winner: usize, loser: usize) -> f64 {
        let mut s = 0.0;
        for k in 0..self.rank() {
            s += self.users.get(user, k) * (self.items.get(winner, k) - self.items.get(loser, k));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_init_is_in_unit_interval_and_seeded() {
        let a = FactorTables::random(3, 4, 2, 11);
        let b = FactorTables::random(3, 4, 2, 11);
        assert_eq!(a.users.to_vec(), b.users.to_vec());
        assert_eq!(a.items.to_vec(), b.items.to_vec());
        assert_ne!(a.users.to_vec(), a.items.to_vec()[..6].to_vec());
        for v in a.users.to_vec().into_iter().chain(a.items.to_vec()) {
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn rows_round_trip_through_cells() {
        let t = FactorTable::zeros(2, 3);
        t.write_row(1, &[1.5, -2.0, 0.25]);
        let mut row = [0.0; 3];
        t.read_row(1, &mut row);
        assert_eq!(row, [1.5, -2.0, 0.25]);
        assert_eq!(t.get(0, 2), 0.0);
        t.set(0, 2, 4.0);
        assert_eq!(t.to_vec(), vec![0.0, 0.0, 4.0, 1.5, -2.0, 0.25]);
    }

    #[test]
    fn margin_matches_definition() {
        let tables =
            FactorTables::from_row_major(1, 3, 2, &[1.0, 0.0], &[0.0, 0.0, 2.0, 0.0, 0.0, 0.0])
                .unwrap();
        assert_eq!(tables.margin(0, 1, 2), 2.0);
        assert_eq!(tables.margin(0, 2, 1), -2.0);
        assert_eq!(tables.score(0, 1), 2.0);
    }

    #[test]
    fn from_row_major_checks_length() {
        assert!(FactorTable::from_row_major(2, 2, &[1.0; 3]).is_err());
    }
}
