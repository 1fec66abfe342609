//! # Trialtrack: Resumable Experiment Tracking
//!
//! **Version**: 0.1.0
//!
//! Trialtrack records computational experiments as *trials*: directories of
//! plain JSON, CSV and text files holding parameters, captured environment
//! metadata, metric series, attachments and the final result. Computations
//! are written as explicit step loops, so a trial interrupted mid-run can be
//! resumed from its latest checkpoint with the same parameters and finish as
//! if never interrupted.
//!
//! ## Design Principles
//!
//! - **Plain files**: every artifact is human-readable JSON, CSV or text;
//!   no database, no daemon
//! - **Crash safety**: all writes are temp-file-plus-rename atomic, so a
//!   killed run never leaves a torn manifest or checkpoint
//! - **Failure asymmetry**: computation failures are *recorded* into the
//!   trial and surfaced lazily; hook and storage failures propagate
//!   immediately
//! - **Explicit context**: the tracker is threaded through every call
//!   signature, never stashed in ambient thread-local state
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trialtrack::{FnComputation, InplaceRunner, ParamMap};
//! use serde_json::{json, Value};
//!
//! let runner = InplaceRunner::new("./trials");
//! let params: ParamMap = [("x".to_string(), json!(21))].into_iter().collect();
//!
//! let mut double = FnComputation::new(|tracker, params: &ParamMap| {
//!     let x = params["x"].as_i64().unwrap_or(0);
//!     tracker.inform([("algo".to_string(), json!("doubling"))].into_iter().collect());
//!     Ok(Value::from(x * 2))
//! });
//! let trial = runner.run_computation("calc/double", &mut double, params)?;
//! assert_eq!(trial.result()?, Some(json!(42)));
//! # Ok::<(), trialtrack::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bench;
pub mod error;
pub mod hooks;
pub mod meta;
pub mod metrics;
pub mod resumable;
pub mod runner;
pub mod storage;
pub mod tracker;
pub mod trial;

pub use bench::{BenchOptions, StatsCollector};
pub use error::{Error, Result};
pub use hooks::{Hook, HookPipeline};
pub use metrics::{MetricFormat, MetricRow, MetricsSink};
pub use resumable::{
    ComputationRegistry, FnComputation, ResumableComputation, SnapshotPolicy, StepOutcome,
};
pub use runner::process::ProcessRunner;
pub use runner::{InplaceRunner, Runner};
pub use storage::FsStore;
pub use tracker::{InfusedTracker, Tracker};
pub use trial::{InfoMap, ParamMap, Trial, TrialRecord, TrialStatus};
