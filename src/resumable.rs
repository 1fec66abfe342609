//! The resumable computation contract.
//!
//! A computation advances in discrete steps under the tracker's drive loop
//! and exposes its progress as plain structured data (maps, lists, scalars)
//! through explicit [`save_state`]/[`load_state`] operations, so a checkpoint
//! written mid-run is enough to resume without re-running `init`.
//!
//! `step()` must depend only on its own persisted fields plus the step index;
//! external non-reproducible state breaks resume correctness. Side effects
//! inside `step()` are at-least-once: work done after the last checkpoint is
//! redone on resume.
//!
//! [`save_state`]: ResumableComputation::save_state
//! [`load_state`]: ResumableComputation::load_state

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::tracker::Tracker;
use crate::trial::ParamMap;
use crate::{Error, Result};

/// Outcome of one computation step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The computation has more steps to take.
    Continue,
    /// The computation produced its final value.
    Done(Value),
}

/// When the tracker should write a checkpoint.
///
/// Both conditions may be set; whichever triggers first wins. The default
/// never checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Checkpoint every N steps.
    pub snapshot_each: Option<u64>,
    /// Checkpoint once this much wall-clock time has passed since the last
    /// one.
    pub snapshot_period: Option<Duration>,
}

impl SnapshotPolicy {
    /// Policy that never checkpoints.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            snapshot_each: None,
            snapshot_period: None,
        }
    }

    /// Checkpoint every `steps` steps.
    #[must_use]
    pub const fn each(steps: u64) -> Self {
        Self {
            snapshot_each: Some(steps),
            snapshot_period: None,
        }
    }

    /// Checkpoint after every elapsed `period`.
    #[must_use]
    pub const fn period(period: Duration) -> Self {
        Self {
            snapshot_each: None,
            snapshot_period: Some(period),
        }
    }

    /// Whether a checkpoint is due after `steps_since_last` steps and
    /// `elapsed` wall-clock time since the last one.
    #[must_use]
    pub fn is_due(&self, steps_since_last: u64, elapsed: Duration) -> bool {
        let by_count = self
            .snapshot_each
            .is_some_and(|each| each > 0 && steps_since_last >= each);
        let by_time = self.snapshot_period.is_some_and(|period| elapsed >= period);
        by_count || by_time
    }
}

/// A user-supplied incremental computation driven by the tracker.
pub trait ResumableComputation: Send {
    /// Initialize from the trial parameters. Called once on a fresh start,
    /// never after a resume.
    fn init(&mut self, tracker: &mut Tracker, params: &ParamMap) -> Result<()>;

    /// Advance one step.
    fn step(&mut self, tracker: &mut Tracker) -> Result<StepOutcome>;

    /// Turn the final step value into the stored result. Default passes the
    /// value through unchanged.
    fn finalize(&mut self, tracker: &mut Tracker, value: Value) -> Result<Value> {
        let _ = tracker;
        Ok(value)
    }

    /// Release resources after the final value is produced. Default no-op.
    fn cleanup(&mut self, tracker: &mut Tracker) -> Result<()> {
        let _ = tracker;
        Ok(())
    }

    /// Serialize internal progress as plain structured data.
    fn save_state(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Restore internal progress from a previously saved state.
    fn load_state(&mut self, state: Value) -> Result<()> {
        let _ = state;
        Ok(())
    }

    /// Checkpoint cadence for this computation.
    fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::never()
    }
}

impl std::fmt::Debug for dyn ResumableComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResumableComputation")
    }
}

/// Adapter turning a plain closure into a single-step computation.
///
/// The closure runs entirely inside one `step()`, so such a trial is never
/// resumable mid-call; it still gets the full record/annotation/metric
/// machinery.
pub struct FnComputation<F> {
    func: F,
    params: ParamMap,
}

impl<F> FnComputation<F>
where
    F: FnMut(&mut Tracker, &ParamMap) -> Result<Value> + Send,
{
    /// Wrap a closure.
    pub fn new(func: F) -> Self {
        Self {
            func,
            params: ParamMap::new(),
        }
    }
}

impl<F> ResumableComputation for FnComputation<F>
where
    F: FnMut(&mut Tracker, &ParamMap) -> Result<Value> + Send,
{
    fn init(&mut self, _tracker: &mut Tracker, params: &ParamMap) -> Result<()> {
        self.params = params.clone();
        Ok(())
    }

    fn step(&mut self, tracker: &mut Tracker) -> Result<StepOutcome> {
        let value = (self.func)(tracker, &self.params)?;
        Ok(StepOutcome::Done(value))
    }
}

type Factory = Box<dyn Fn() -> Box<dyn ResumableComputation> + Send + Sync>;

/// Name-to-factory registry of computations.
///
/// Runners resolve computations by name through the registry instead of
/// marshaling code: the isolated-worker protocol transfers only a registry
/// key plus a plain parameter map.
#[derive(Default)]
pub struct ComputationRegistry {
    factories: DashMap<String, Factory>,
}

impl ComputationRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous entry.
    pub fn register<C, F>(&self, name: impl Into<String>, factory: F)
    where
        C: ResumableComputation + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.factories
            .insert(name.into(), Box::new(move || Box::new(factory())));
    }

    /// Instantiate a fresh computation by name.
    ///
    /// # Errors
    /// Returns [`Error::UnknownComputation`] for an unregistered name.
    pub fn create(&self, name: &str) -> Result<Box<dyn ResumableComputation>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownComputation(name.to_string()))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ComputationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationRegistry")
            .field("names", &self.names())
            .finish()
    }
}
