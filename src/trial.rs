//! Trial records and the read-side trial handle.
//!
//! A [`TrialRecord`] is the persisted manifest of one tracked attempt: who it
//! is, what it was asked to do, where it stands, and what came out. It is
//! mutated only by the owning tracker and published atomically at every
//! status transition, so the manifest on disk always describes a consistent
//! point in the lifecycle.
//!
//! [`Trial`] is the after-the-fact view: it loads the manifest back and
//! reports a recorded computation failure lazily, when the result is asked
//! for.

use std::collections::BTreeMap;
use std::fs::File;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::FsStore;
use crate::{Error, Result};

/// Manifest file name inside every trial directory.
pub const MANIFEST_FILE: &str = "trial.json";

/// Checkpoint blob file name inside a trial directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Traceback artifact written for failed trials.
pub const TRACEBACK_FILE: &str = "traceback.txt";

/// Manifest schema version written into every record.
pub const SCHEMA_VERSION: u32 = 1;

/// Immutable mapping of parameter name to value, captured at creation.
pub type ParamMap = BTreeMap<String, Value>;

/// Free-form annotation mapping accumulated by `inform` calls.
pub type InfoMap = BTreeMap<String, Value>;

/// Status of a trial.
///
/// Transitions are monotonic: `Pending → Running | Resumed → Done | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    /// Created but not yet executing.
    Pending,
    /// Executing from a fresh start.
    Running,
    /// Executing from a restored checkpoint.
    Resumed,
    /// Finished successfully; `result` is present.
    Done,
    /// Finished with a recorded error; `error` is present.
    Failed,
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Resumed => "resumed",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle timestamps of a trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// When execution started, if it has.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started: Option<DateTime<Utc>>,
    /// When execution resumed from a checkpoint, if it did.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resumed: Option<DateTime<Utc>>,
    /// When execution finished, if it has.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished: Option<DateTime<Utc>>,
}

/// Persisted manifest of one trial attempt.
///
/// Round-trips losslessly through JSON. Underscore-prefixed parameters are
/// stripped before the record is built (they still reach the computation and
/// take part in resume comparison, see the tracker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Manifest schema version.
    pub schema_version: u32,
    /// Hierarchical trial id, caller-chosen, not guaranteed unique.
    pub tid: String,
    /// Random instance id, unique per attempt.
    pub uid: String,
    /// Environment metadata snapshot, captured once.
    pub meta: Value,
    /// Parameters captured at creation (underscore keys excluded).
    pub params: ParamMap,
    /// Current status.
    pub status: TrialStatus,
    /// Lifecycle timestamps.
    pub at: Timestamps,
    /// Wall-clock duration of the computation in seconds, set on finish.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<f64>,
    /// Final result, present iff status is `Done`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    /// Error text, present iff status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Annotations accumulated by `inform` calls.
    #[serde(default)]
    pub info: InfoMap,
}

impl TrialRecord {
    /// Create a fresh record in `Pending` status with a random instance id.
    ///
    /// `params` should already have underscore-prefixed keys stripped; see
    /// [`strip_private_params`].
    #[must_use]
    pub fn new(tid: impl Into<String>, meta: Value, params: ParamMap) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tid: tid.into(),
            uid: uuid::Uuid::new_v4().simple().to_string(),
            meta,
            params,
            status: TrialStatus::Pending,
            at: Timestamps {
                created: Utc::now(),
                started: None,
                resumed: None,
                finished: None,
            },
            duration: None,
            result: None,
            error: None,
            info: InfoMap::new(),
        }
    }

    /// Transition `Pending → Running` and stamp the start time.
    pub fn start(&mut self) {
        self.status = TrialStatus::Running;
        self.at.started = Some(Utc::now());
    }

    /// Transition to `Resumed` and stamp the resume time. Start time and
    /// creation time are the restored values from the checkpoint.
    pub fn resume(&mut self) {
        self.status = TrialStatus::Resumed;
        self.at.resumed = Some(Utc::now());
    }

    /// Transition to `Done` with the finalized result.
    ///
    /// Clears any error left over from a previous failed attempt that was
    /// resumed to completion.
    pub fn complete(&mut self, result: Value, duration_secs: f64) {
        self.status = TrialStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.duration = Some(duration_secs);
        self.at.finished = Some(Utc::now());
    }

    /// Transition to `Failed` with the recorded error text.
    pub fn fail(&mut self, error: impl Into<String>, duration_secs: f64) {
        self.status = TrialStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
        self.duration = Some(duration_secs);
        self.at.finished = Some(Utc::now());
    }
}

/// Strip underscore-prefixed keys from a parameter map.
///
/// The underscore convention marks parameters that should reach the
/// computation but stay out of the persisted manifest.
#[must_use]
pub fn strip_private_params(params: &ParamMap) -> ParamMap {
    params
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Read-side handle over a persisted trial.
///
/// Loading is lazy: construction only records where the trial lives; the
/// manifest is read per call so a reload after an external update is just
/// another call.
#[derive(Debug, Clone)]
pub struct Trial {
    store: FsStore,
    tid: String,
}

impl Trial {
    /// Open a trial under `store` by id. Does not touch the filesystem.
    pub fn open(store: FsStore, tid: impl Into<String>) -> Self {
        Self {
            store,
            tid: tid.into(),
        }
    }

    /// Trial id this handle points at.
    #[must_use]
    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// Load the persisted manifest.
    ///
    /// # Errors
    /// Returns [`Error::BadManifest`] when the manifest is missing or does
    /// not parse.
    pub fn record(&self) -> Result<TrialRecord> {
        let rel = format!("{}/{MANIFEST_FILE}", self.tid);
        self.store.read_json(&rel).map_err(|e| Error::BadManifest {
            path: self.store.trial_dir(&self.tid).display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Result of the trial.
    ///
    /// For a failed trial this reconstructs the recorded failure as
    /// [`Error::TrialFailed`], the lazy failure report. The traceback
    /// artifact remains available via [`Trial::traceback`].
    ///
    /// # Errors
    /// Returns [`Error::TrialFailed`] for a failed trial, or a manifest
    /// error when the trial cannot be loaded.
    pub fn result(&self) -> Result<Option<Value>> {
        let record = self.record()?;
        if record.status == TrialStatus::Failed {
            return Err(Error::TrialFailed {
                tid: self.tid.clone(),
                error: record.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(record.result)
    }

    /// Recorded traceback text of a failed trial, if present.
    #[must_use]
    pub fn traceback(&self) -> Option<String> {
        let rel = format!("{}/{TRACEBACK_FILE}", self.tid);
        self.store.read_to_string(&rel).ok()
    }

    /// Open an attachment of this trial for reading.
    ///
    /// # Errors
    /// Returns [`Error::Io`] when the attachment does not exist.
    pub fn attach(&self, name: &str) -> Result<File> {
        self.store.open_read(&format!("{}/{name}", self.tid))
    }

    /// List attachment names (everything in the trial directory except the
    /// manifest), sorted.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the trial directory cannot be traversed.
    pub fn attachments(&self) -> Result<Vec<String>> {
        self.store.list_attachments(&self.tid, MANIFEST_FILE)
    }
}
