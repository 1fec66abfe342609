//! The trial lifecycle engine.
//!
//! A [`Tracker`] owns exactly one [`TrialRecord`], drives a
//! [`ResumableComputation`] to completion, mediates annotation/metric/
//! attachment calls, persists every state transition, and invokes lifecycle
//! hooks. One tracker maps to one trial attempt and must be driven by a
//! single thread; no internal locking is provided.
//!
//! Failure semantics, in one place:
//! - checkpoint params mismatch: raised before any computation code runs;
//! - computation errors (`init`/`step`/`finalize`/`cleanup`): recorded into
//!   the manifest with a traceback artifact, never raised from `run`;
//! - hook errors and storage errors: propagate immediately, unrecorded.

use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::hooks::HookPipeline;
use crate::metrics::{MetricFormat, MetricsSink};
use crate::resumable::{ResumableComputation, SnapshotPolicy, StepOutcome};
use crate::storage::{AtomicFile, FsStore};
use crate::trial::{
    strip_private_params, InfoMap, ParamMap, Trial, TrialRecord, CHECKPOINT_FILE, SCHEMA_VERSION,
    TRACEBACK_FILE,
};
use crate::{Error, Result};

/// Persisted resume state: the computation's serialized progress plus the
/// tracker's own bookkeeping. Opaque to the storage layer; only the
/// tracker/computation pair that produced it needs to read it back.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    schema_version: u32,
    /// Full parameter map, underscore keys included, for resume comparison.
    params: ParamMap,
    step_index: u64,
    record: TrialRecord,
    state: Value,
}

/// The engine mediating one trial's side effects and lifecycle.
pub struct Tracker {
    store: FsStore,
    record: TrialRecord,
    full_params: ParamMap,
    metrics: MetricsSink,
    hooks: Arc<HookPipeline>,
    step_index: u64,
    steps_since_snapshot: u64,
    last_snapshot: Instant,
}

impl Tracker {
    /// Create a tracker for trial `tid` with the given captured metadata and
    /// parameters. The record starts in `Pending`; nothing is persisted until
    /// [`Tracker::run`].
    #[must_use]
    pub fn new(
        store: FsStore,
        tid: impl Into<String>,
        meta: Value,
        params: ParamMap,
        hooks: Arc<HookPipeline>,
    ) -> Self {
        let tid = tid.into();
        let record = TrialRecord::new(&tid, meta, strip_private_params(&params));
        let metrics = MetricsSink::new(store.clone(), &tid);
        Self {
            store,
            record,
            full_params: params,
            metrics,
            hooks,
            step_index: 0,
            steps_since_snapshot: 0,
            last_snapshot: Instant::now(),
        }
    }

    /// Trial id.
    #[must_use]
    pub fn tid(&self) -> &str {
        &self.record.tid
    }

    /// Instance id of this attempt.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.record.uid
    }

    /// The live record.
    #[must_use]
    pub fn record(&self) -> &TrialRecord {
        &self.record
    }

    /// Current step index of the driven computation.
    #[must_use]
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Read-side handle over this trial's persisted form.
    #[must_use]
    pub fn trial(&self) -> Trial {
        Trial::open(self.store.clone(), &self.record.tid)
    }

    /// Drive the computation to a terminal status.
    ///
    /// Resolves resume-vs-fresh-start from the persisted checkpoint, runs the
    /// step loop with synchronous checkpointing per the computation's
    /// [`SnapshotPolicy`], and persists the final record. A computation error
    /// is recorded, not returned; read it later through
    /// [`Trial::result`](crate::Trial::result).
    ///
    /// # Errors
    /// Returns [`Error::ConfigMismatch`] when a checkpoint exists with
    /// different parameters (before any computation code runs), hook errors
    /// verbatim, and storage errors from manifest/checkpoint/metric writes.
    pub fn run(&mut self, computation: &mut dyn ResumableComputation) -> Result<()> {
        let resumed = self.load_checkpoint(computation)?;
        if resumed {
            self.record.resume();
        } else {
            self.record.start();
        }
        self.dump_manifest()?;

        let hooks = Arc::clone(&self.hooks);
        hooks.started(self)?;

        let policy = computation.snapshot_policy();
        let started = Instant::now();
        let mut failure: Option<Error> = None;
        let mut result: Option<Value> = None;

        if !resumed {
            let params = self.full_params.clone();
            match computation.init(self, &params) {
                Ok(()) => {
                    // Initial checkpoint so a crash before the first due
                    // point still resumes past init.
                    if policy != SnapshotPolicy::never() {
                        self.snapshot(computation)?;
                    }
                }
                Err(e) => failure = Some(e),
            }
        }

        while failure.is_none() && result.is_none() {
            match computation.step(self) {
                Err(e) => failure = Some(e),
                Ok(StepOutcome::Continue) => {
                    self.step_index += 1;
                    self.steps_since_snapshot += 1;
                    if policy.is_due(self.steps_since_snapshot, self.last_snapshot.elapsed()) {
                        self.snapshot(computation)?;
                    }
                }
                Ok(StepOutcome::Done(value)) => {
                    self.step_index += 1;
                    match computation.finalize(self, value) {
                        Err(e) => failure = Some(e),
                        Ok(final_value) => match computation.cleanup(self) {
                            Err(e) => failure = Some(e),
                            Ok(()) => result = Some(final_value),
                        },
                    }
                }
            }
        }

        let duration = started.elapsed().as_secs_f64();
        match failure {
            None => {
                self.record
                    .complete(result.unwrap_or(Value::Null), duration);
            }
            Some(e) => {
                debug!(tid = %self.record.tid, "record computation failure: {e}");
                self.write_traceback(&e)?;
                self.record.fail(e.to_string(), duration);
            }
        }

        hooks.finished(self)?;
        self.metrics.flush()?;
        self.dump_manifest()?;
        Ok(())
    }

    /// Merge fields into the trial's info mapping. A value-changing
    /// overwrite logs a warning; last write wins.
    pub fn inform(&mut self, fields: InfoMap) {
        for (key, value) in fields {
            if let Some(old) = self.record.info.get(&key) {
                if *old != value {
                    warn!(tid = %self.record.tid, key, %old, new = %value,
                        "overwriting informed field");
                }
            }
            self.record.info.insert(key, value);
        }
    }

    /// Append a metric row to `series`.
    ///
    /// # Errors
    /// Returns [`Error::FormatMismatch`] when the series was first written
    /// with a different format, or a storage error on rotation.
    pub fn meter(&mut self, series: &str, fields: InfoMap, format: MetricFormat) -> Result<()> {
        self.metrics.meter(series, fields, format)
    }

    /// Open a named write attachment scoped to the trial directory.
    ///
    /// With `autocommit` (the default discipline) content is published when
    /// the handle is dropped, even if the caller's code panics first; pass
    /// `false` to require an explicit [`AtomicFile::commit`].
    ///
    /// # Errors
    /// Returns [`Error::Io`] when the staging file cannot be created.
    pub fn attach_write(&self, name: &str, autocommit: bool) -> Result<AtomicFile> {
        self.store
            .open_write(&format!("{}/{name}", self.record.tid), autocommit)
    }

    /// Open a named attachment of this trial for reading.
    ///
    /// # Errors
    /// Returns [`Error::Io`] when the attachment does not exist.
    pub fn attach_read(&self, name: &str) -> Result<File> {
        self.store.open_read(&format!("{}/{name}", self.record.tid))
    }

    /// Persist the manifest and flush metric buffers. Idempotent.
    ///
    /// # Errors
    /// Returns hook errors and storage errors verbatim.
    pub fn flush(&mut self) -> Result<()> {
        self.dump_manifest()?;
        self.metrics.flush()
    }

    /// Build a sibling handle for auxiliary annotation of this trial.
    #[must_use]
    pub fn infused(&self) -> InfusedTracker {
        InfusedTracker::new(
            self.store.clone(),
            &self.record.tid,
            Arc::clone(&self.hooks),
        )
    }

    fn dump_manifest(&mut self) -> Result<()> {
        let hooks = Arc::clone(&self.hooks);
        hooks.flushed(self)?;
        let rel = format!("{}/{}", self.record.tid, crate::trial::MANIFEST_FILE);
        self.store.write_json(&rel, &self.record)
    }

    /// Synchronously serialize full state to the checkpoint blob. Flushes
    /// metrics and the manifest first so the durable view is consistent
    /// at-or-before the checkpoint.
    fn snapshot(&mut self, computation: &dyn ResumableComputation) -> Result<()> {
        self.metrics.flush()?;
        self.dump_manifest()?;
        let checkpoint = Checkpoint {
            schema_version: SCHEMA_VERSION,
            params: self.full_params.clone(),
            step_index: self.step_index,
            record: self.record.clone(),
            state: computation.save_state()?,
        };
        let rel = format!("{}/{CHECKPOINT_FILE}", self.record.tid);
        debug!(tid = %self.record.tid, step = self.step_index, "write checkpoint");
        self.store.write_json(&rel, &checkpoint)?;
        self.steps_since_snapshot = 0;
        self.last_snapshot = Instant::now();
        Ok(())
    }

    fn load_checkpoint(&mut self, computation: &mut dyn ResumableComputation) -> Result<bool> {
        let rel = format!("{}/{CHECKPOINT_FILE}", self.record.tid);
        if !self.store.exists(&rel) {
            return Ok(false);
        }
        let checkpoint: Checkpoint = match self.store.read_json(&rel) {
            Ok(c) => c,
            Err(e) => {
                warn!(tid = %self.record.tid, "unreadable checkpoint, starting fresh: {e}");
                return Ok(false);
            }
        };

        if checkpoint.params != self.full_params {
            return Err(Error::ConfigMismatch {
                tid: self.record.tid.clone(),
                stored: serde_json::to_string(&checkpoint.params).unwrap_or_default(),
                requested: serde_json::to_string(&self.full_params).unwrap_or_default(),
            });
        }

        computation.load_state(checkpoint.state)?;
        // Keep this attempt's instance id; everything else is restored.
        let uid = std::mem::take(&mut self.record.uid);
        self.record = checkpoint.record;
        self.record.uid = uid;
        self.step_index = checkpoint.step_index;
        debug!(tid = %self.record.tid, step = self.step_index, "resumed from checkpoint");
        Ok(true)
    }

    fn write_traceback(&self, error: &Error) -> Result<()> {
        use std::io::Write;
        let mut file = self.attach_write(TRACEBACK_FILE, false)?;
        writeln!(file, "Error: {error}")?;
        let mut source = std::error::Error::source(error);
        if source.is_some() {
            writeln!(file, "\nCaused by:")?;
        }
        while let Some(cause) = source {
            writeln!(file, "  - {cause}")?;
            source = cause.source();
        }
        file.commit()
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("tid", &self.record.tid)
            .field("uid", &self.record.uid)
            .field("status", &self.record.status)
            .field("step_index", &self.step_index)
            .finish()
    }
}

/// A lightweight sibling tracker for annotating an existing trial from the
/// outside: its own instance id, its own metric file slug, info persisted to
/// a side file instead of the manifest.
pub struct InfusedTracker {
    store: FsStore,
    tid: String,
    uid: String,
    info: InfoMap,
    metrics: MetricsSink,
    hooks: Arc<HookPipeline>,
}

impl InfusedTracker {
    fn new(store: FsStore, tid: &str, hooks: Arc<HookPipeline>) -> Self {
        let uid = uuid::Uuid::new_v4().simple().to_string();
        let metrics = MetricsSink::with_slug(store.clone(), tid, &uid);
        Self {
            store,
            tid: tid.to_string(),
            uid,
            info: InfoMap::new(),
            metrics,
            hooks,
        }
    }

    /// Trial id this handle annotates.
    #[must_use]
    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// Instance id of this infused handle.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Fire the infused-activate hook event for this handle.
    ///
    /// # Errors
    /// Hook errors propagate verbatim.
    pub fn activate(&mut self) -> Result<()> {
        let hooks = Arc::clone(&self.hooks);
        hooks.infused(self)
    }

    /// Merge fields into this handle's info side file. Same overwrite
    /// semantics as [`Tracker::inform`]; the file is rewritten on every call.
    ///
    /// # Errors
    /// Returns a storage error if the side file cannot be published.
    pub fn inform(&mut self, fields: InfoMap) -> Result<()> {
        for (key, value) in fields {
            if let Some(old) = self.info.get(&key) {
                if *old != value {
                    warn!(tid = %self.tid, key, %old, new = %value,
                        "overwriting informed field");
                }
            }
            self.info.insert(key, value);
        }
        let rel = format!("{}/info-{}.json", self.tid, self.uid);
        self.store.write_json(
            &rel,
            &serde_json::json!({
                "at": chrono::Utc::now(),
                "info": self.info,
            }),
        )
    }

    /// Append a metric row; file names carry this handle's uid slug.
    ///
    /// # Errors
    /// Same as [`Tracker::meter`].
    pub fn meter(&mut self, series: &str, fields: InfoMap, format: MetricFormat) -> Result<()> {
        self.metrics.meter(series, fields, format)
    }

    /// Open a write attachment scoped to the trial directory.
    ///
    /// # Errors
    /// Returns [`Error::Io`] when the staging file cannot be created.
    pub fn attach_write(&self, name: &str, autocommit: bool) -> Result<AtomicFile> {
        self.store
            .open_write(&format!("{}/{name}", self.tid), autocommit)
    }

    /// Flush buffered metrics.
    ///
    /// # Errors
    /// Returns a storage error if a metric file cannot be published.
    pub fn flush(&mut self) -> Result<()> {
        self.metrics.flush()
    }

    /// Flush and release; idempotent.
    ///
    /// # Errors
    /// Returns a storage error if a metric file cannot be published.
    pub fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

impl std::fmt::Debug for InfusedTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfusedTracker")
            .field("tid", &self.tid)
            .field("uid", &self.uid)
            .finish()
    }
}
