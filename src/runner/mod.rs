//! Execution backends.
//!
//! A runner constructs a tracker for a trial and executes it, either
//! synchronously on the caller's thread ([`InplaceRunner`]) or inside a
//! worker drawn from a fixed-size pool of OS processes
//! ([`ProcessRunner`](process::ProcessRunner)). Computations are resolved by
//! name through a [`ComputationRegistry`]; the process boundary only ever
//! carries a registry key plus a plain parameter map.

pub mod process;

use std::path::PathBuf;
use std::sync::Arc;

use crate::hooks::HookPipeline;
use crate::meta;
use crate::resumable::{ComputationRegistry, ResumableComputation};
use crate::storage::FsStore;
use crate::tracker::Tracker;
use crate::trial::{ParamMap, Trial};
use crate::Result;

/// An execution backend for trials.
pub trait Runner {
    /// Execute the named computation as trial `tid` and block until it
    /// reaches a terminal status.
    ///
    /// A recorded computation failure is a successful run here; read it
    /// through [`Trial::result`].
    ///
    /// # Errors
    /// Propagates config-mismatch, hook, storage, and worker-transport
    /// errors.
    fn run(&self, tid: &str, computation: &str, params: ParamMap) -> Result<Trial>;

    /// Release backend resources. Idempotent.
    ///
    /// # Errors
    /// Returns a transport error if a worker refuses to shut down.
    fn close(&mut self) -> Result<()>;
}

/// Synchronous backend: the tracker runs on the caller's thread of control,
/// threaded explicitly through the computation's call signatures.
pub struct InplaceRunner {
    store: FsStore,
    registry: Arc<ComputationRegistry>,
    hooks: Arc<HookPipeline>,
}

impl InplaceRunner {
    /// Create a runner storing trials under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: FsStore::new(root),
            registry: Arc::new(ComputationRegistry::new()),
            hooks: Arc::new(HookPipeline::new()),
        }
    }

    /// Use a shared computation registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ComputationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Attach a hook pipeline applied to every trial this runner executes.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookPipeline) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// The store this runner writes trials into.
    #[must_use]
    pub fn store(&self) -> &FsStore {
        &self.store
    }

    /// Build a tracker for `tid` with freshly captured metadata.
    #[must_use]
    pub fn create_tracker(&self, tid: &str, params: ParamMap) -> Tracker {
        Tracker::new(
            self.store.clone(),
            tid,
            meta::capture_default_meta(),
            params,
            Arc::clone(&self.hooks),
        )
    }

    /// Execute a caller-supplied computation instance as trial `tid`.
    ///
    /// # Errors
    /// Same as [`Runner::run`], minus registry lookup.
    pub fn run_computation(
        &self,
        tid: &str,
        computation: &mut dyn ResumableComputation,
        params: ParamMap,
    ) -> Result<Trial> {
        let mut tracker = self.create_tracker(tid, params);
        tracker.run(computation)?;
        Ok(tracker.trial())
    }
}

impl Runner for InplaceRunner {
    fn run(&self, tid: &str, computation: &str, params: ParamMap) -> Result<Trial> {
        let mut computation = self.registry.create(computation)?;
        self.run_computation(tid, computation.as_mut(), params)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
