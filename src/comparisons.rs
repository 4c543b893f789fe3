use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};

/// One user's preference of `winner` over `loser`. Ids are zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Comparison {
    pub user: u32,
    pub winner: u32,
    pub loser: u32,
}

impl Comparison {
    pub fn new(user: u32, winner: u32, loser: u32) -> Self {
        Self { user, winner, loser }
    }
}

/// Comparisons read from one source.
#[derive(Debug, Default)]
pub struct ParsedComparisons {
    pub comparisons: Vec<Comparison>,
    /// Lines dropped because winner and loser were the same item.
    pub rejected: usize,
}

/// Parse `user winner loser` lines with 1-based ids.
///
/// Columns past the third are ignored, as are blank lines and `#` comments.
pub fn parse_comparisons<R: BufRead>(reader: R, source: &Path) -> Result<ParsedComparisons> {
    let mut out = ParsedComparisons::default();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| Error::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut ids = [0u32; 3];
        let mut fields = trimmed.split_whitespace();
        for slot in ids.iter_mut() {
            let field = fields.next().ok_or_else(|| Error::Parse {
                path: source.to_path_buf(),
                line: line_no,
                message: format!("expected 3 ids, got \"{trimmed}\""),
            })?;
            let id: u32 = field.parse().map_err(|_| Error::Parse {
                path: source.to_path_buf(),
                line: line_no,
                message: format!("invalid id \"{field}\""),
            })?;
            if id == 0 {
                return Err(Error::Parse {
                    path: source.to_path_buf(),
                    line: line_no,
                    message: "ids are 1-based, got 0".to_string(),
                });
            }
            *slot = id - 1;
        }

        if ids[1] == ids[2] {
            out.rejected += 1;
            continue;
        }
        out.comparisons.push(Comparison::new(ids[0], ids[1], ids[2]));
    }

    if out.rejected > 0 {
        warn!(
            source = %source.display(),
            rejected = out.rejected,
            "dropped comparisons of an item with itself"
        );
    }
    Ok(out)
}

fn read_comparisons(path: &Path) -> Result<ParsedComparisons> {
    let file = File::open(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_comparisons(BufReader::new(file), path)
}

/// Training comparisons per user and per item.
#[derive(Debug, Clone)]
pub struct EntityCounts {
    users: Vec<u32>,
    items: Vec<u32>,
}

impl EntityCounts {
    fn from_comparisons(comparisons: &[Comparison], n_users: usize, n_items: usize) -> Self {
        let mut users = vec![0u32; n_users];
        let mut items = vec![0u32; n_items];
        for c in comparisons {
            users[c.user as usize] += 1;
            items[c.winner as usize] += 1;
            items[c.loser as usize] += 1;
        }
        Self { users, items }
    }

    pub fn user(&self, u: usize) -> u32 {
        self.users[u]
    }

    pub fn item(&self, i: usize) -> u32 {
        self.items[i]
    }

    /// Regularization divisor for user `u`. Users seen only in test data count as 1.
    #[inline(always)]
    pub fn user_divisor(&self, u: usize) -> f64 {
        self.users[u].max(1) as f64
    }

    /// Regularization divisor for item `i`. Items seen only in test data count as 1.
    #[inline(always)]
    pub fn item_divisor(&self, i: usize) -> f64 {
        self.items[i].max(1) as f64
    }
}

/// Immutable training and testing comparisons plus the derived per-user
/// grouping and per-entity counts.
#[derive(Debug, Clone)]
pub struct ComparisonStore {
    train: Vec<Comparison>,
    test: Vec<Comparison>,
    n_users: usize,
    n_items: usize,
    counts: EntityCounts,
    // CSR over training comparisons, grouped by user
    user_indptr: Vec<usize>,
    user_order: Vec<usize>,
}

impl ComparisonStore {
    pub fn load(train_path: &Path, test_path: &Path) -> Result<Self> {
        let train = read_comparisons(train_path)?;
        let test = read_comparisons(test_path)?;
        let store = Self::from_comparisons(train.comparisons, test.comparisons);
        info!(
            users = store.n_users,
            items = store.n_items,
            train = store.train.len(),
            test = store.test.len(),
            "loaded comparisons"
        );
        Ok(store)
    }

    /// Build a store from in-memory comparisons. Self-comparisons are dropped.
    pub fn from_comparisons(mut train: Vec<Comparison>, mut test: Vec<Comparison>) -> Self {
        train.retain(|c| c.winner != c.loser);
        test.retain(|c| c.winner != c.loser);

        let mut n_users = 0usize;
        let mut n_items = 0usize;
        for c in train.iter().chain(test.iter()) {
            n_users = n_users.max(c.user as usize + 1);
            n_items = n_items.max(c.winner.max(c.loser) as usize + 1);
        }

        let counts = EntityCounts::from_comparisons(&train, n_users, n_items);
        let (user_indptr, user_order) = group_by_user(&train, n_users);

        Self {
            train,
            test,
            n_users,
            n_items,
            counts,
            user_indptr,
            user_order,
        }
    }

    pub fn train(&self) -> &[Comparison] {
        &self.train
    }

    pub fn test(&self) -> &[Comparison] {
        &self.test
    }

    pub fn n_users(&self) -> usize {
        self.n_users
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn counts(&self) -> &EntityCounts {
        &self.counts
    }

    /// Indices into [`train`](Self::train) of user `u`'s comparisons, in file order.
    pub fn user_comparisons(&self, u: usize) -> &[usize] {
        &self.user_order[self.user_indptr[u]..self.user_indptr[u + 1]]
    }
}

fn group_by_user(train: &[Comparison], n_users: usize) -> (Vec<usize>, Vec<usize>) {
    let mut counts = vec![0usize; n_users];
    for c in train {
        counts[c.user as usize] += 1;
    }
    let mut indptr = vec![0usize; n_users + 1];
    for u in 0..n_users {
        indptr[u + 1] = indptr[u] + counts[u];
    }
    let mut order = vec![0usize; train.len()];
    let mut pos = indptr[..n_users].to_vec();
    for (idx, c) in train.iter().enumerate() {
        let u = c.user as usize;
        order[pos[u]] = idx;
        pos[u] += 1;
    }
    (indptr, order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(text: &str) -> Result<ParsedComparisons> {
        parse_comparisons(Cursor::new(text), Path::new("mem"))
    }

    #[test]
    fn test_parse_converts_to_zero_based() {
        let parsed = parse("1 2 3\n2 3 1\n").unwrap();
        assert_eq!(
            parsed.comparisons,
            vec![Comparison::new(0, 1, 2), Comparison::new(1, 2, 0)]
        );
        assert_eq!(parsed.rejected, 0);
    }

    #[test]
    fn test_parse_skips_blank_and_comment_lines_and_extra_columns() {
        let parsed = parse("# header\n\n1 2 3 1\n  \n").unwrap();
        assert_eq!(parsed.comparisons, vec![Comparison::new(0, 1, 2)]);
    }

    #[test]
    fn test_parse_rejects_self_comparison() {
        let parsed = parse("1 2 2\n1 2 3\n").unwrap();
        assert_eq!(parsed.comparisons.len(), 1);
        assert_eq!(parsed.rejected, 1);
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = parse("1 2 3\n1 x 3\n").unwrap_err();
        match err {
            Error::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_short_line_and_zero_id() {
        assert!(matches!(parse("1 2\n"), Err(Error::Parse { .. })));
        assert!(matches!(parse("0 1 2\n"), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_bounds_include_test_ids() {
        let store = ComparisonStore::from_comparisons(
            vec![Comparison::new(0, 0, 1)],
            vec![Comparison::new(4, 1, 6)],
        );
        assert_eq!(store.n_users(), 5);
        assert_eq!(store.n_items(), 7);
        // item 6 only appears in the test set
        assert_eq!(store.counts().item(6), 0);
        assert_eq!(store.counts().item_divisor(6), 1.0);
        assert_eq!(store.counts().user_divisor(4), 1.0);
    }

    #[test]
    fn test_counts_and_user_groups() {
        let train = vec![
            Comparison::new(0, 0, 1),
            Comparison::new(1, 1, 2),
            Comparison::new(0, 2, 3),
            Comparison::new(2, 3, 0),
        ];
        let store = ComparisonStore::from_comparisons(train, vec![]);
        assert_eq!(store.counts().user(0), 2);
        assert_eq!(store.counts().item(0), 2);
        assert_eq!(store.counts().item(3), 2);
        assert_eq!(store.user_comparisons(0), &[0, 2]);
        assert_eq!(store.user_comparisons(1), &[1]);
        assert_eq!(store.user_comparisons(2), &[3]);

        let mut all: Vec<usize> = (0..store.n_users())
            .flat_map(|u| store.user_comparisons(u).to_vec())
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_from_comparisons_drops_self_comparisons() {
        let store = ComparisonStore::from_comparisons(
            vec![Comparison::new(0, 1, 1), Comparison::new(0, 0, 1)],
            vec![Comparison::new(0, 2, 2)],
        );
        assert_eq!(store.train().len(), 1);
        assert!(store.test().is_empty());
    }
}
