//! Concurrent load-generation and latency statistics.
//!
//! A fixed-size pool of worker threads drains a bounded queue of call jobs;
//! the blocking producer side of the queue is the sole backpressure
//! mechanism, bounding memory regardless of how many calls a run submits.
//! Workers funnel every outcome into one mutex-guarded [`StatsCollector`].
//! The whole benchmark executes as a tracked trial, so the computed report
//! is persisted as the trial's result and per-call rows land in the metric
//! series.
//!
//! There is no per-call timeout or cancellation: a stuck call blocks its
//! worker indefinitely. A duration-based stop only halts new submissions;
//! in-flight and queued calls drain before statistics are computed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::debug;

use crate::hooks::HookPipeline;
use crate::meta;
use crate::metrics::{MetricFormat, MetricRow};
use crate::resumable::FnComputation;
use crate::storage::FsStore;
use crate::tracker::Tracker;
use crate::trial::{ParamMap, Trial};
use crate::{Error, Result};

/// Percentiles requested by default.
pub const DEFAULT_PERCENTILES: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 75.0, 90.0, 95.0, 97.0, 98.0, 99.0, 99.5, 99.9,
];

/// Benchmark run configuration.
#[derive(Debug, Clone)]
pub struct BenchOptions {
    /// Number of pool workers.
    pub concurrency: usize,
    /// Stop after this many statistics-bearing calls. Mutually exclusive
    /// with `duration`.
    pub number: Option<u64>,
    /// Stop submitting new calls after this much wall-clock time. Mutually
    /// exclusive with `number`.
    pub duration: Option<Duration>,
    /// Calls discarded from statistics before timing starts.
    pub warmup: u64,
    /// Abort the run on the first observed error.
    pub strict: bool,
    /// Capacity of the most-recent-errors ring.
    pub max_errors: usize,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            number: Some(1),
            duration: None,
            warmup: 0,
            strict: false,
            max_errors: 100,
        }
    }
}

impl BenchOptions {
    fn validate(&self) -> Result<()> {
        if self.number.is_some() && self.duration.is_some() {
            return Err(Error::other(
                "benchmark stop conditions are mutually exclusive: set number or duration, not both",
            ));
        }
        if self.number.is_none() && self.duration.is_none() {
            return Err(Error::other(
                "benchmark needs a stop condition: set number or duration",
            ));
        }
        Ok(())
    }
}

/// Exact percentile selection over sorted data.
///
/// For each requested percentile `p` the reported value is
/// `data[ceil(size * p / 100) - 1]`, included only when
/// `size > 500 / min(p, 100 - p)`, a resolution guard. Percentiles failing
/// the guard are omitted, never approximated.
#[must_use]
pub fn calc_percentiles(sorted: &[f64], pcts: &[f64]) -> BTreeMap<String, f64> {
    let size = sorted.len();
    let mut out = BTreeMap::new();
    for &p in pcts {
        let tail = p.min(100.0 - p);
        if tail <= 0.0 || (size as f64) <= 500.0 / tail {
            continue;
        }
        let idx = ((size as f64 * p / 100.0).ceil() as usize).saturating_sub(1);
        out.insert(format_pct(p), sorted[idx.min(size - 1)]);
    }
    out
}

fn format_pct(p: f64) -> String {
    if (p - p.trunc()).abs() < f64::EPSILON {
        format!("{}", p as u64)
    } else {
        format!("{p}")
    }
}

/// Shared, lock-protected accumulator of per-call outcomes.
///
/// The enclosing mutex serializes concurrent `add_result` calls from the
/// pool workers.
#[derive(Debug)]
pub struct StatsCollector {
    warmup_left: i64,
    started: Instant,
    finished: Option<Instant>,
    total_count: u64,
    total_time: f64,
    errors_count: u64,
    durations: Vec<f64>,
    results: BTreeMap<String, u64>,
    errors: BTreeMap<String, u64>,
    recent_errors: VecDeque<String>,
    max_errors: usize,
    metric_rows: Vec<MetricRow>,
}

impl StatsCollector {
    /// Collector that discards the first `warmup` calls and retains at most
    /// `max_errors` recent error texts.
    #[must_use]
    pub fn new(warmup: u64, max_errors: usize) -> Self {
        Self {
            warmup_left: i64::try_from(warmup).unwrap_or(i64::MAX),
            started: Instant::now(),
            finished: None,
            total_count: 0,
            total_time: 0.0,
            errors_count: 0,
            durations: Vec::new(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            recent_errors: VecDeque::new(),
            max_errors,
            metric_rows: Vec::new(),
        }
    }

    /// Record one call outcome. `duration` is absent for failed calls.
    pub fn add_result(&mut self, result: Option<Value>, duration: Option<f64>, error: Option<String>) {
        if self.warmup_left > 0 {
            self.warmup_left -= 1;
            return;
        }
        if self.warmup_left == 0 {
            // Timing starts with the first statistics-bearing call.
            self.started = Instant::now();
            self.warmup_left = -1;
        }

        self.total_count += 1;
        let result_key = result
            .as_ref()
            .map_or_else(|| "null".to_string(), Value::to_string);
        *self.results.entry(result_key).or_insert(0) += 1;

        self.metric_rows.push(
            [
                ("duration".to_string(), duration.map_or(Value::Null, Value::from)),
                ("result".to_string(), result.unwrap_or(Value::Null)),
                (
                    "error".to_string(),
                    error.clone().map_or(Value::Null, Value::from),
                ),
            ]
            .into_iter()
            .collect(),
        );

        if let Some(d) = duration {
            self.durations.push(d);
            self.total_time += d;
        }

        if let Some(text) = error {
            self.errors_count += 1;
            *self.errors.entry(text.clone()).or_insert(0) += 1;
            if self.max_errors > 0 {
                if self.recent_errors.len() == self.max_errors {
                    self.recent_errors.pop_front();
                }
                self.recent_errors.push_back(text);
            }
        }
    }

    /// Most recently retained error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&String> {
        self.recent_errors.back()
    }

    /// Number of statistics-bearing recorded calls.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    fn take_metric_rows(&mut self) -> Vec<MetricRow> {
        std::mem::take(&mut self.metric_rows)
    }

    /// Compute the final report. Freezes the finish time on first call.
    #[must_use]
    pub fn calculate_statistics(&mut self) -> Value {
        let finished = *self.finished.get_or_insert_with(Instant::now);
        let elapsed = finished.duration_since(self.started).as_secs_f64();
        let real_rps = if elapsed > 0.0 {
            self.total_count as f64 / elapsed
        } else {
            0.0
        };

        let duration_stats = if self.durations.is_empty() {
            Value::Null
        } else {
            let mut sorted = self.durations.clone();
            sorted.sort_by(f64::total_cmp);
            let n = sorted.len() as f64;
            let average = self.total_time / n;
            let variance =
                self.durations.iter().map(|x| (x - average).powi(2)).sum::<f64>() / n;
            json!({
                "average": average,
                "minimum": sorted[0],
                "maximum": sorted[sorted.len() - 1],
                "std_dev": variance.sqrt(),
                "percentiles": calc_percentiles(&sorted, &DEFAULT_PERCENTILES),
            })
        };

        let mut results: Vec<(&String, &u64)> = self.results.iter().collect();
        results.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let mut errors: Vec<(&String, &u64)> = self.errors.iter().collect();
        errors.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        json!({
            "total_count": self.total_count,
            "total_time": self.total_time,
            "real_rps": real_rps,
            "duration": duration_stats,
            "results": results
                .into_iter()
                .map(|(k, v)| json!({"result": k, "count": v}))
                .collect::<Vec<_>>(),
            "errors_count": self.errors_count,
            "errors": errors
                .into_iter()
                .map(|(k, v)| json!({"error": k, "count": v}))
                .collect::<Vec<_>>(),
        })
    }
}

fn do_one_call<F>(collector: &Mutex<StatsCollector>, callback: &F, params: &ParamMap)
where
    F: Fn(&ParamMap) -> Result<Value>,
{
    let start = Instant::now();
    let (result, duration, error) = match callback(params) {
        Ok(value) => (Some(value), Some(start.elapsed().as_secs_f64()), None),
        Err(e) => (None, None, Some(e.to_string())),
    };
    collector
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .add_result(result, duration, error);
}

/// Execute a benchmark as a tracked trial under `root/tid`.
///
/// The callback is invoked repeatedly from `options.concurrency` pool
/// workers; the computed statistics report becomes the trial's result and
/// every per-call outcome is metered into the default series.
///
/// # Errors
/// Returns option-validation errors and storage/hook errors immediately. A
/// strict-mode abort is recorded as the trial's failure, like any other
/// computation failure, and also surfaces from the returned trial's
/// `result()`.
pub fn run<F>(
    root: impl Into<std::path::PathBuf>,
    tid: &str,
    params: ParamMap,
    options: &BenchOptions,
    callback: F,
) -> Result<Trial>
where
    F: Fn(&ParamMap) -> Result<Value> + Send + Sync,
{
    options.validate()?;

    let store = FsStore::new(root);
    let mut tracker = Tracker::new(
        store,
        tid,
        meta::capture_default_meta(),
        params,
        Arc::new(HookPipeline::new()),
    );

    let options = options.clone();
    let callback = &callback;
    let mut computation = FnComputation::new(move |tracker: &mut Tracker, params: &ParamMap| {
        drive_pool(tracker, params, &options, callback)
    });
    tracker.run(&mut computation)?;
    Ok(tracker.trial())
}

fn drive_pool<F>(
    tracker: &mut Tracker,
    params: &ParamMap,
    options: &BenchOptions,
    callback: &F,
) -> Result<Value>
where
    F: Fn(&ParamMap) -> Result<Value> + Send + Sync,
{
    let concurrency = options.concurrency.max(1);
    let collector = Mutex::new(StatsCollector::new(options.warmup, options.max_errors));

    let stats = std::thread::scope(|scope| -> Result<()> {
        // Bounded queue: the blocking send below is the backpressure that
        // bounds memory no matter how many calls get submitted.
        let (tx, rx) = mpsc::sync_channel::<()>(concurrency * 4);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..concurrency {
            let rx = Arc::clone(&rx);
            let collector = &collector;
            scope.spawn(move || loop {
                let job = rx
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .recv();
                match job {
                    Ok(()) => do_one_call(collector, callback, params),
                    Err(_) => break,
                }
            });
        }

        let check_strict = |collector: &Mutex<StatsCollector>| -> Result<()> {
            if options.strict {
                let guard = collector
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(last) = guard.last_error() {
                    return Err(Error::other(format!("benchmark aborted: {last}")));
                }
            }
            Ok(())
        };

        let submit = |tx: &mpsc::SyncSender<()>| -> Result<()> {
            tx.send(())
                .map_err(|_| Error::other("benchmark pool stopped accepting jobs"))
        };

        let submission: Result<()> = (|| {
            if let Some(number) = options.number {
                for _ in 0..(number + options.warmup) {
                    submit(&tx)?;
                    check_strict(&collector)?;
                    drain_rows(tracker, &collector)?;
                }
            } else if let Some(duration) = options.duration {
                let deadline = Instant::now() + duration;
                while Instant::now() < deadline {
                    submit(&tx)?;
                    check_strict(&collector)?;
                    drain_rows(tracker, &collector)?;
                }
            }
            Ok(())
        })();

        // Dropping the sender lets workers drain the queue and exit; the
        // scope joins them before statistics are computed.
        drop(tx);
        submission
    })
    .and_then(|()| check_strict_final(&collector, options))
    .map(|()| {
        collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .calculate_statistics()
    });

    // Rows from calls that completed after the last submission.
    drain_rows(tracker, &collector)?;

    stats
}

/// Move buffered per-call rows out of the collector and into the tracker's
/// metric sink, which rotates full files out itself. Called from the driving
/// thread between submissions so no buffer grows with the length of the run.
fn drain_rows(tracker: &mut Tracker, collector: &Mutex<StatsCollector>) -> Result<()> {
    let rows = collector
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take_metric_rows();
    if rows.is_empty() {
        return Ok(());
    }
    debug!(rows = rows.len(), "meter benchmark calls");
    for row in rows {
        tracker.meter("", row, MetricFormat::Csv)?;
    }
    Ok(())
}

fn check_strict_final(collector: &Mutex<StatsCollector>, options: &BenchOptions) -> Result<()> {
    if options.strict {
        let guard = collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(last) = guard.last_error() {
            return Err(Error::other(format!("benchmark aborted: {last}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_exact_spec_example() {
        // 1000 durations valued 1..=1000 ms.
        let data: Vec<f64> = (1..=1000).map(f64::from).collect();
        let pcts = calc_percentiles(&data, &[50.0]);
        assert_eq!(pcts["50"], 500.0);
    }

    #[test]
    fn test_percentile_guard_omits_unresolvable() {
        let data: Vec<f64> = (1..=100).map(f64::from).collect();
        // p=99 needs size > 500/min(99, 1) = 500; 100 samples fail the guard.
        let pcts = calc_percentiles(&data, &[50.0, 99.0]);
        assert!(pcts.contains_key("50"));
        assert!(!pcts.contains_key("99"));
    }

    #[test]
    fn test_percentile_fractional_key() {
        let data: Vec<f64> = (1..=10_000).map(f64::from).collect();
        let pcts = calc_percentiles(&data, &[99.5]);
        assert_eq!(pcts["99.5"], 9950.0);
    }

    #[test]
    fn test_warmup_discards_before_timing() {
        let mut collector = StatsCollector::new(5, 10);
        for i in 0..25 {
            collector.add_result(Some(json!(i)), Some(0.001), None);
        }
        assert_eq!(collector.total_count(), 20);
    }

    #[test]
    fn test_error_ring_bounded() {
        let mut collector = StatsCollector::new(0, 3);
        for i in 0..10 {
            collector.add_result(None, None, Some(format!("err-{i}")));
        }
        assert_eq!(collector.recent_errors.len(), 3);
        assert_eq!(collector.last_error().unwrap(), "err-9");
        // Full error counts are still aggregated.
        assert_eq!(collector.errors_count, 10);
    }

    #[test]
    fn test_statistics_shape() {
        let mut collector = StatsCollector::new(0, 10);
        collector.add_result(Some(json!("ok")), Some(0.010), None);
        collector.add_result(Some(json!("ok")), Some(0.020), None);
        collector.add_result(None, None, Some("boom".to_string()));

        let stats = collector.calculate_statistics();
        assert_eq!(stats["total_count"], json!(3));
        assert_eq!(stats["errors_count"], json!(1));
        assert_eq!(stats["duration"]["minimum"], json!(0.010));
        assert_eq!(stats["duration"]["maximum"], json!(0.020));
        assert_eq!(stats["results"][0]["count"], json!(2));
    }

    #[test]
    fn test_options_stop_conditions_exclusive() {
        let options = BenchOptions {
            number: Some(5),
            duration: Some(Duration::from_secs(1)),
            ..BenchOptions::default()
        };
        assert!(options.validate().is_err());

        let options = BenchOptions {
            number: None,
            duration: None,
            ..BenchOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
