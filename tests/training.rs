//! End-to-end runs through the public API on files written to a temp dir.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use collrank::evaluate::test_error;
use collrank::rng::XorShift64;
use collrank::{
    BinaryEvaluator, Comparison, ComparisonStore, Error, Evaluator, Method, Sampling, TrainConfig,
    Trainer,
};
use tempfile::TempDir;

/// Comparisons ordered by a hidden rank-3 model, 1-based on disk.
fn planted_comparisons(
    n_users: usize,
    n_items: usize,
    per_train: usize,
    per_test: usize,
    seed: u64,
) -> (Vec<Comparison>, Vec<Comparison>) {
    let mut rng = XorShift64::new(seed);
    let mut draw = |n: usize| -> Vec<[f64; 3]> {
        (0..n)
            .map(|_| [0; 3].map(|_| rng.next_f64() * 2.0 - 1.0))
            .collect()
    };
    let users = draw(n_users);
    let items = draw(n_items);
    let score = |u: usize, i: usize| -> f64 { (0..3).map(|k| users[u][k] * items[i][k]).sum() };

    let mut train = Vec::new();
    let mut test = Vec::new();
    for u in 0..n_users {
        for (n, out) in [(per_train, &mut train), (per_test, &mut test)] {
            let mut made = 0;
            while made < n {
                let a = rng.next_index(n_items);
                let b = rng.next_index(n_items);
                if a == b {
                    continue;
                }
                let (w, l) = if score(u, a) >= score(u, b) { (a, b) } else { (b, a) };
                out.push(Comparison::new(u as u32, w as u32, l as u32));
                made += 1;
            }
        }
    }
    (train, test)
}

fn write_comparisons(dir: &Path, name: &str, comparisons: &[Comparison]) -> PathBuf {
    let mut text = String::from("# user winner loser\n");
    for c in comparisons {
        writeln!(text, "{} {} {}", c.user + 1, c.winner + 1, c.loser + 1).unwrap();
    }
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn planted_store(dir: &TempDir) -> ComparisonStore {
    let (train, test) = planted_comparisons(20, 30, 40, 10, 42);
    let train_path = write_comparisons(dir.path(), "train.txt", &train);
    let test_path = write_comparisons(dir.path(), "test.txt", &test);
    ComparisonStore::load(&train_path, &test_path).unwrap()
}

#[test]
fn test_load_reports_missing_file() {
    let dir = TempDir::new().unwrap();
    let train = write_comparisons(dir.path(), "train.txt", &[Comparison::new(0, 0, 1)]);
    let missing = dir.path().join("nope.txt");
    match ComparisonStore::load(&train, &missing) {
        Err(Error::Io { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected Io error, got {other:?}"),
    }
}

#[test]
fn test_load_reports_malformed_line() {
    let dir = TempDir::new().unwrap();
    let train = dir.path().join("train.txt");
    fs::write(&train, "1 2 3\n1 two 3\n").unwrap();
    let test = write_comparisons(dir.path(), "test.txt", &[]);
    match ComparisonStore::load(&train, &test) {
        Err(Error::Parse { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected Parse error, got {other:?}"),
    }
}

#[test]
fn test_loaded_store_matches_written_data() {
    let dir = TempDir::new().unwrap();
    let store = planted_store(&dir);
    assert_eq!(store.train().len(), 800);
    assert_eq!(store.test().len(), 200);
    assert_eq!(store.n_users(), 20);
    assert!(store.n_items() <= 30);
}

#[test]
fn test_sgd_learns_planted_order() {
    let dir = TempDir::new().unwrap();
    let store = planted_store(&dir);
    let config = TrainConfig {
        rank: 3,
        seed: Some(7),
        sgd: collrank::config::SgdConfig {
            epochs: 30,
            ..Default::default()
        },
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(store, config, 4).unwrap();
    let before = test_error(trainer.tables(), trainer.store().train());

    let outcome = trainer.train().unwrap();
    let after = test_error(trainer.tables(), trainer.store().train());

    assert!(before > 0.3, "random init should misorder many pairs, got {before}");
    assert!(after < 0.15, "training error {after} after SGD");
    assert!(outcome.test_error() < 0.3, "test error {}", outcome.test_error());
    assert!(outcome.test_error() < outcome.initial_metrics.test_error.unwrap());
    let ndcg = outcome.final_metrics.ndcg.unwrap();
    assert!((0.0..=1.0).contains(&ndcg));
}

#[test]
fn test_partitioned_sampling_runs_every_worker() {
    let dir = TempDir::new().unwrap();
    let store = planted_store(&dir);
    let config = TrainConfig {
        rank: 3,
        seed: Some(11),
        partitions: Some(3),
        sgd: collrank::config::SgdConfig {
            epochs: 10,
            sampling: Sampling::Partitioned,
            ..Default::default()
        },
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(store, config, 3).unwrap();
    let outcome = trainer.train().unwrap();
    let sgd = outcome.sgd.unwrap();
    assert_eq!(sgd.iterations_per_worker, 800 * 10 / 3);
    assert_eq!(sgd.updates + sgd.satisfied, 3 * (800 * 10 / 3) as u64);

    let partitions = trainer.partitions().unwrap();
    assert_eq!(partitions.n_parts(), 3);
    assert_eq!(partitions.sizes().iter().sum::<usize>(), 800);
}

#[test]
fn test_alternating_run_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = planted_store(&dir);
    let mut config = TrainConfig {
        method: Method::Alternating,
        rank: 3,
        seed: Some(5),
        ..TrainConfig::default()
    };
    config.alternating.rounds = 3;
    let mut trainer = Trainer::new(store, config, 2).unwrap();
    let outcome = trainer.train().unwrap();

    let alt = outcome.alternating.as_ref().unwrap();
    assert_eq!(alt.rounds_completed, 3);
    for report in &alt.reports {
        assert_eq!(report.skipped_users, 0);
        assert_eq!(report.skipped_items, 0);
        assert!((0.0..=1.0).contains(&report.train_error));
    }

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["method"], "alternating");
    assert_eq!(json["threads"], 2);
    assert!(json.get("sgd").is_none());
}

#[test]
fn test_binary_evaluator_adds_precision() {
    let dir = TempDir::new().unwrap();
    let store = planted_store(&dir);
    let implicit_train = dir.path().join("implicit_train.txt");
    let implicit_test = dir.path().join("implicit_test.txt");
    fs::write(&implicit_train, "1 1\n1 2\n2 3\n").unwrap();
    fs::write(&implicit_test, "1 4\n2 5\n").unwrap();
    let evaluator = BinaryEvaluator::load(&implicit_train, &implicit_test, vec![1, 5]).unwrap();

    let config = TrainConfig {
        rank: 3,
        seed: Some(1),
        sgd: collrank::config::SgdConfig {
            epochs: 2,
            ..Default::default()
        },
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(store, config, 2)
        .unwrap()
        .with_evaluator(Evaluator::Binary(evaluator))
        .unwrap();
    let outcome = trainer.train().unwrap();

    let ks: Vec<usize> = outcome.final_metrics.precision_at_k.iter().map(|p| p.0).collect();
    assert_eq!(ks, vec![1, 5]);
    for (_, p) in &outcome.final_metrics.precision_at_k {
        assert!((0.0..=1.0).contains(p));
    }
    assert!(outcome.final_metrics.test_error.is_some());
}
