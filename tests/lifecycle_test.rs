//! End-to-end trial lifecycle tests
//!
//! Drive computations through the synchronous runner and assert on what
//! actually lands on disk: manifest shape, annotation and metric artifacts,
//! attachments, and the recorded-vs-raised failure split.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tempfile::tempdir;
use trialtrack::{
    Error, FnComputation, Hook, HookPipeline, InfoMap, InfusedTracker, InplaceRunner,
    MetricFormat, ParamMap, Result, Tracker, TrialStatus,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_env_filter("trialtrack=debug").try_init();
}

fn params(pairs: &[(&str, Value)]) -> ParamMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn info(pairs: &[(&str, Value)]) -> InfoMap {
    params(pairs)
}

// =============================================================================
// Manifest shape
// =============================================================================

#[test]
fn test_done_trial_manifest_shape() {
    init_logging();
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    let mut comp = FnComputation::new(|tracker: &mut Tracker, params: &ParamMap| {
        tracker.inform(info(&[("phase", json!("fit"))]));
        let x = params["x"].as_i64().unwrap_or(0);
        Ok(json!({"score": x * 2}))
    });
    let trial = runner
        .run_computation("sweep/run-1", &mut comp, params(&[("x", json!(21))]))
        .unwrap();

    let record = trial.record().unwrap();
    assert_eq!(record.schema_version, 1);
    assert_eq!(record.tid, "sweep/run-1");
    assert!(!record.uid.is_empty());
    assert_eq!(record.status, TrialStatus::Done);
    assert_eq!(record.params["x"], json!(21));
    assert_eq!(record.result, Some(json!({"score": 42})));
    assert_eq!(record.info["phase"], json!("fit"));
    assert!(record.duration.is_some());
    assert!(record.at.started.is_some());
    assert!(record.at.finished.is_some());
    assert!(record.at.resumed.is_none());
    // Captured environment metadata is an object with at least the system
    // section.
    assert!(record.meta.get("system").is_some());
}

#[test]
fn test_underscore_params_reach_computation_but_not_manifest() {
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    let mut comp = FnComputation::new(|_tracker: &mut Tracker, params: &ParamMap| {
        // The computation sees the full map, private keys included.
        Ok(json!(params["_seed"].as_i64().unwrap_or(-1)))
    });
    let trial = runner
        .run_computation(
            "t",
            &mut comp,
            params(&[("x", json!(1)), ("_seed", json!(42))]),
        )
        .unwrap();

    assert_eq!(trial.result().unwrap(), Some(json!(42)));
    let record = trial.record().unwrap();
    assert!(record.params.contains_key("x"));
    assert!(!record.params.contains_key("_seed"));
}

// =============================================================================
// Failure asymmetry
// =============================================================================

#[test]
fn test_computation_failure_recorded_and_reported_lazily() {
    init_logging();
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    let mut comp = FnComputation::new(|_tracker: &mut Tracker, _params: &ParamMap| {
        Err::<Value, _>(Error::other("gradient exploded"))
    });
    // The run itself succeeds.
    let trial = runner.run_computation("t", &mut comp, ParamMap::new()).unwrap();

    let record = trial.record().unwrap();
    assert_eq!(record.status, TrialStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("gradient exploded"));
    assert!(record.result.is_none());

    let err = trial.result().unwrap_err();
    assert!(matches!(err, Error::TrialFailed { .. }));
    assert!(trial.traceback().unwrap().contains("gradient exploded"));
}

#[test]
fn test_metric_format_mismatch_is_a_recorded_failure() {
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    let mut comp = FnComputation::new(|tracker: &mut Tracker, _params: &ParamMap| {
        tracker.meter("loss", info(&[("v", json!(1))]), MetricFormat::Csv)?;
        tracker.meter("loss", info(&[("v", json!(2))]), MetricFormat::Jsonl)?;
        Ok(Value::Null)
    });
    let trial = runner.run_computation("t", &mut comp, ParamMap::new()).unwrap();

    assert_eq!(trial.record().unwrap().status, TrialStatus::Failed);
    let err = trial.result().unwrap_err();
    assert!(err.to_string().contains("already uses format"));
}

// =============================================================================
// Hooks
// =============================================================================

struct Recording {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Recording {
    fn push(&self, event: &str) {
        self.events.lock().unwrap().push(format!("{}:{event}", self.label));
    }
}

impl Hook for Recording {
    fn on_start(&self, _tracker: &mut Tracker) -> Result<()> {
        self.push("start");
        Ok(())
    }
    fn on_flush(&self, _tracker: &mut Tracker) -> Result<()> {
        self.push("flush");
        Ok(())
    }
    fn on_finish(&self, _tracker: &mut Tracker) -> Result<()> {
        self.push("finish");
        Ok(())
    }
    fn on_infused(&self, _tracker: &mut InfusedTracker) -> Result<()> {
        self.push("infused");
        Ok(())
    }
}

#[test]
fn test_hook_events_fire_in_order() {
    let dir = tempdir().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookPipeline::new();
    hooks.register(Box::new(Recording {
        label: "h",
        events: Arc::clone(&events),
    }));

    let runner = InplaceRunner::new(dir.path()).with_hooks(hooks);
    let mut comp =
        FnComputation::new(|_tracker: &mut Tracker, _params: &ParamMap| Ok(Value::Null));
    runner.run_computation("t", &mut comp, ParamMap::new()).unwrap();

    // Manifest dumps bracket the run, each firing a flush event.
    assert_eq!(
        *events.lock().unwrap(),
        vec!["h:flush", "h:start", "h:finish", "h:flush"]
    );
}

#[test]
fn test_multiple_hooks_interleave_in_registration_order() {
    let dir = tempdir().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookPipeline::new();
    hooks.register(Box::new(Recording {
        label: "a",
        events: Arc::clone(&events),
    }));
    hooks.register(Box::new(Recording {
        label: "b",
        events: Arc::clone(&events),
    }));

    let runner = InplaceRunner::new(dir.path()).with_hooks(hooks);
    let mut comp =
        FnComputation::new(|_tracker: &mut Tracker, _params: &ParamMap| Ok(Value::Null));
    runner.run_computation("t", &mut comp, ParamMap::new()).unwrap();

    // Each event reaches every hook exactly once, always a-before-b.
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "a:flush", "b:flush", "a:start", "b:start", "a:finish", "b:finish", "a:flush",
            "b:flush",
        ]
    );
}

#[test]
fn test_infused_activate_reaches_hooks() {
    let dir = tempdir().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookPipeline::new();
    hooks.register(Box::new(Recording {
        label: "a",
        events: Arc::clone(&events),
    }));
    hooks.register(Box::new(Recording {
        label: "b",
        events: Arc::clone(&events),
    }));

    let runner = InplaceRunner::new(dir.path()).with_hooks(hooks);
    let tracker = runner.create_tracker("t", ParamMap::new());
    let mut infused = tracker.infused();
    infused.activate().unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["a:infused", "b:infused"]);
}

#[test]
fn test_failing_infused_hook_propagates_from_activate() {
    struct Angry;
    impl Hook for Angry {
        fn on_infused(&self, _tracker: &mut InfusedTracker) -> Result<()> {
            Err(Error::other("no sidecars"))
        }
    }

    let dir = tempdir().unwrap();
    let mut hooks = HookPipeline::new();
    hooks.register(Box::new(Angry));
    let runner = InplaceRunner::new(dir.path()).with_hooks(hooks);

    let tracker = runner.create_tracker("t", ParamMap::new());
    let mut infused = tracker.infused();
    let err = infused.activate().unwrap_err();
    assert!(err.to_string().contains("no sidecars"));
}

#[test]
fn test_failing_finish_hook_aborts_the_run() {
    struct Angry;
    impl Hook for Angry {
        fn on_finish(&self, _tracker: &mut Tracker) -> Result<()> {
            Err(Error::other("finish vetoed"))
        }
    }

    let dir = tempdir().unwrap();
    let mut hooks = HookPipeline::new();
    hooks.register(Box::new(Angry));
    let runner = InplaceRunner::new(dir.path()).with_hooks(hooks);

    let mut comp =
        FnComputation::new(|_tracker: &mut Tracker, _params: &ParamMap| Ok(Value::Null));
    let err = runner
        .run_computation("t", &mut comp, ParamMap::new())
        .unwrap_err();
    assert!(err.to_string().contains("finish vetoed"));
}

// =============================================================================
// Attachments and metrics on disk
// =============================================================================

#[test]
fn test_attachments_published_and_listed() {
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    let mut comp = FnComputation::new(|tracker: &mut Tracker, _params: &ParamMap| {
        use std::io::Write;
        let mut file = tracker.attach_write("notes.txt", true)?;
        writeln!(file, "converged after 3 epochs")?;
        // Autocommit publishes on drop.
        drop(file);
        Ok(Value::Null)
    });
    let trial = runner.run_computation("t", &mut comp, ParamMap::new()).unwrap();

    let names = trial.attachments().unwrap();
    assert!(names.contains(&"notes.txt".to_string()));

    use std::io::Read;
    let mut text = String::new();
    trial.attach("notes.txt").unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "converged after 3 epochs\n");
}

#[test]
fn test_metric_series_written_on_finish() {
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    let mut comp = FnComputation::new(|tracker: &mut Tracker, _params: &ParamMap| {
        for i in 0..3 {
            tracker.meter("loss", info(&[("value", json!(i))]), MetricFormat::Jsonl)?;
        }
        Ok(Value::Null)
    });
    let trial = runner.run_computation("t", &mut comp, ParamMap::new()).unwrap();

    let names = trial.attachments().unwrap();
    assert!(names.iter().any(|n| n.starts_with("metrics-") && n.ends_with("-loss.jsonl")));
}

#[test]
fn test_store_lists_finished_trials() {
    let dir = tempdir().unwrap();
    let runner = InplaceRunner::new(dir.path());

    for tid in ["sweep/a", "sweep/b", "solo"] {
        let mut comp =
            FnComputation::new(|_tracker: &mut Tracker, _params: &ParamMap| Ok(Value::Null));
        runner.run_computation(tid, &mut comp, ParamMap::new()).unwrap();
    }

    let tids = runner.store().find_trials("trial.json");
    assert_eq!(tids, vec!["solo", "sweep/a", "sweep/b"]);
}
