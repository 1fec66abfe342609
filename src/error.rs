//! Error types for trialtrack
//!
//! Each failure class has distinct propagation semantics: configuration and
//! storage errors are raised immediately, computation failures are recorded
//! into the manifest and only surface lazily when the result is read, and
//! worker transport faults are never folded into recorded trial failures.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trialtrack error types
#[derive(Error, Debug)]
pub enum Error {
    /// Resumed checkpoint carries different parameters than the current call.
    /// Raised before any computation code runs.
    #[error("checkpoint params mismatch for trial '{tid}': stored {stored}, requested {requested}")]
    ConfigMismatch {
        /// Trial id whose checkpoint was rejected
        tid: String,
        /// Parameters persisted in the checkpoint
        stored: String,
        /// Parameters passed to the current run
        requested: String,
    },

    /// A previously executed trial finished with status=failed.
    ///
    /// This is the lazy report of a computation failure: it is produced when
    /// the trial's result is read, never from the run itself.
    #[error("trial '{tid}' failed: {error}")]
    TrialFailed {
        /// Trial id
        tid: String,
        /// Error text recorded in the manifest
        error: String,
    },

    /// A metric series was requested with a format other than the one fixed
    /// at its first write.
    #[error("metric series '{series}' already uses format {existing}, requested {requested}")]
    FormatMismatch {
        /// Series name
        series: String,
        /// Format fixed at first write
        existing: String,
        /// Format of the rejected request
        requested: String,
    },

    /// Isolated worker crashed or the transport protocol broke down.
    ///
    /// Distinct from a recorded trial failure: the trial may not have been
    /// persisted at all.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// Trial manifest is missing or structurally invalid
    #[error("invalid trial manifest at {path}: {reason}")]
    BadManifest {
        /// Manifest path
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// Computation name not present in the registry
    #[error("unknown computation '{0}'")]
    UnknownComputation(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an [`Error::Other`] from anything displayable.
    pub fn other(msg: impl std::fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }
}
