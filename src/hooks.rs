//! Lifecycle observers.
//!
//! Hooks receive the live tracker at four lifecycle points. Broadcast order
//! is registration order. Unlike computation errors, which are recorded into
//! the manifest, a hook error propagates immediately out of the tracker call
//! that triggered it: hooks are infrastructure and must fail loud.

use crate::tracker::{InfusedTracker, Tracker};
use crate::Result;

/// One lifecycle observer. Every callback is a no-op by default.
pub trait Hook: Send + Sync {
    /// The trial has transitioned to running/resumed and is about to step.
    fn on_start(&self, tracker: &mut Tracker) -> Result<()> {
        let _ = tracker;
        Ok(())
    }

    /// The manifest is about to be written.
    fn on_flush(&self, tracker: &mut Tracker) -> Result<()> {
        let _ = tracker;
        Ok(())
    }

    /// The trial has finished, in either terminal status.
    fn on_finish(&self, tracker: &mut Tracker) -> Result<()> {
        let _ = tracker;
        Ok(())
    }

    /// An infused tracker was activated against this trial.
    fn on_infused(&self, tracker: &mut InfusedTracker) -> Result<()> {
        let _ = tracker;
        Ok(())
    }
}

/// Ordered broadcast of lifecycle events to registered hooks.
#[derive(Default)]
pub struct HookPipeline {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookPipeline {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; it will be invoked after all previously registered
    /// hooks.
    pub fn register(&mut self, hook: Box<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the pipeline has no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Broadcast the start event.
    ///
    /// # Errors
    /// The first hook error aborts the broadcast and propagates.
    pub fn started(&self, tracker: &mut Tracker) -> Result<()> {
        for hook in &self.hooks {
            hook.on_start(tracker)?;
        }
        Ok(())
    }

    /// Broadcast the flush event.
    ///
    /// # Errors
    /// The first hook error aborts the broadcast and propagates.
    pub fn flushed(&self, tracker: &mut Tracker) -> Result<()> {
        for hook in &self.hooks {
            hook.on_flush(tracker)?;
        }
        Ok(())
    }

    /// Broadcast the finish event.
    ///
    /// # Errors
    /// The first hook error aborts the broadcast and propagates, aborting
    /// the trial's finishing sequence.
    pub fn finished(&self, tracker: &mut Tracker) -> Result<()> {
        for hook in &self.hooks {
            hook.on_finish(tracker)?;
        }
        Ok(())
    }

    /// Broadcast the infused-activate event.
    ///
    /// # Errors
    /// The first hook error aborts the broadcast and propagates.
    pub fn infused(&self, tracker: &mut InfusedTracker) -> Result<()> {
        for hook in &self.hooks {
            hook.on_infused(tracker)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
