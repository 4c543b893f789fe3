//! Error types for loading data and configuring a ranking run.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for collrank operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a run before or while it is being set up.
///
/// Failures inside the optimization loops never surface here: solver
/// refusals are skipped and non-finite predictions are reported through the
/// evaluator's worst-case score.
#[derive(Debug, Error)]
pub enum Error {
    /// An input or config file could not be opened or read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line in a comparison source is malformed.
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A configuration file could not be parsed.
    #[error("invalid config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Empty input where non-empty was required.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// The partition oracle broke its contract.
    #[error("partition oracle: {0}")]
    Partition(String),

    /// The worker pool could not be created.
    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
