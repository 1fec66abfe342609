//! Batched, rotating metric writer.
//!
//! Metric rows are buffered in memory per named series and written out in
//! rotating files bounded by a maximum row count. Each row carries an `at`
//! UNIX timestamp plus arbitrary scalar fields. A series' encoding is fixed
//! at its first write; a later request with a different format is a hard
//! error.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::storage::FsStore;
use crate::{Error, Result};

/// Default rows per metric file before rotation.
pub const DEFAULT_ROWS_PER_FILE: usize = 10_000;

/// Encoding of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFormat {
    /// Row-oriented tabular file, `.csv`.
    Csv,
    /// Line-delimited JSON, `.jsonl`.
    Jsonl,
}

impl MetricFormat {
    /// File extension for this format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Jsonl => "jsonl",
        }
    }
}

impl std::fmt::Display for MetricFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// One metric row: scalar fields keyed by name.
pub type MetricRow = BTreeMap<String, Value>;

/// Batched rotating writer of timestamped metric rows, partitioned into
/// named series.
#[derive(Debug)]
pub struct MetricsSink {
    store: FsStore,
    tid: String,
    slug: String,
    rows_per_file: usize,
    buffers: HashMap<String, Vec<MetricRow>>,
    formats: HashMap<String, MetricFormat>,
    file_seq: u64,
}

impl MetricsSink {
    /// Create a sink writing under the trial directory of `tid`.
    #[must_use]
    pub fn new(store: FsStore, tid: impl Into<String>) -> Self {
        Self::with_slug(store, tid, "")
    }

    /// Create a sink whose file names carry an extra slug, used by infused
    /// trackers so parallel writers never collide.
    #[must_use]
    pub fn with_slug(store: FsStore, tid: impl Into<String>, slug: &str) -> Self {
        Self {
            store,
            tid: tid.into(),
            slug: if slug.is_empty() {
                String::new()
            } else {
                format!("-{slug}")
            },
            rows_per_file: DEFAULT_ROWS_PER_FILE,
            buffers: HashMap::new(),
            formats: HashMap::new(),
            file_seq: 0,
        }
    }

    /// Override the rotation threshold.
    #[must_use]
    pub fn with_rows_per_file(mut self, rows: usize) -> Self {
        self.rows_per_file = rows.max(1);
        self
    }

    /// Append one metric row to `series`, stamping it with the current time.
    ///
    /// The series' format is fixed by its first `meter` call.
    ///
    /// # Errors
    /// Returns [`Error::FormatMismatch`] if `format` differs from the one
    /// fixed at first write, or a storage error if a full buffer fails to
    /// rotate out.
    pub fn meter(&mut self, series: &str, fields: MetricRow, format: MetricFormat) -> Result<()> {
        let existing = *self.formats.entry(series.to_string()).or_insert(format);
        if existing != format {
            return Err(Error::FormatMismatch {
                series: series.to_string(),
                existing: existing.to_string(),
                requested: format.to_string(),
            });
        }

        if self
            .buffers
            .get(series)
            .is_some_and(|b| b.len() >= self.rows_per_file)
        {
            self.flush()?;
        }

        let mut row = fields;
        row.insert(
            "at".to_string(),
            Value::from(Utc::now().timestamp_micros() as f64 / 1e6),
        );
        self.buffers.entry(series.to_string()).or_default().push(row);
        Ok(())
    }

    /// Write out every non-empty series buffer. Idempotent; an empty sink is
    /// a no-op.
    ///
    /// # Errors
    /// Returns a storage error if a metric file cannot be published.
    pub fn flush(&mut self) -> Result<()> {
        let series_names: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for series in series_names {
            self.flush_series(&series)?;
        }
        Ok(())
    }

    fn flush_series(&mut self, series: &str) -> Result<()> {
        let Some(rows) = self.buffers.get_mut(series) else {
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(rows);
        let format = self.formats[series];

        let name = if series.is_empty() {
            format!(
                "metrics{}-{:04}.{}",
                self.slug,
                self.file_seq,
                format.extension()
            )
        } else {
            format!(
                "metrics{}-{:04}-{}.{}",
                self.slug,
                self.file_seq,
                series,
                format.extension()
            )
        };
        self.file_seq += 1;

        debug!(series, file = name, rows = rows.len(), "write metrics");
        let rel = format!("{}/{name}", self.tid);
        let mut file = self.store.open_write(&rel, false)?;
        match format {
            MetricFormat::Csv => write_csv(&mut file, &rows)?,
            MetricFormat::Jsonl => write_jsonl(&mut file, &rows)?,
        }
        file.commit()
    }
}

fn write_jsonl(out: &mut impl Write, rows: &[MetricRow]) -> Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *out, row)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn write_csv(out: &mut impl Write, rows: &[MetricRow]) -> Result<()> {
    // Columns: `at` first, then the sorted union of field names.
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if key != "at" && !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }
    columns.sort_unstable();
    columns.insert(0, "at");

    writeln!(out, "{}", columns.join(","))?;
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|col| row.get(*col).map(csv_cell).unwrap_or_default())
            .collect();
        writeln!(out, "{}", cells.join(","))?;
    }
    Ok(())
}

fn csv_cell(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.contains(',') || text.contains('"') || text.contains('\n') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}
