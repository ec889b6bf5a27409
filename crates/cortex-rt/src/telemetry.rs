//! Telemetry recorder: per-window records and run summaries.
//!
//! One record per window, append-only, line-delimited JSON by default or
//! CSV on request. An aborted run leaves the file well-formed but
//! truncated; the summary carries the abort cause. Statistics exclude
//! warmup windows and errored rows, but both are still written as records —
//! the raw file is the ground truth.

use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// One dispatched window. Field order is the CSV column order.
#[derive(Debug, Clone, Serialize)]
pub struct WindowRecord {
    pub run_id: String,
    pub plugin: String,
    pub dtype: String,
    pub window_index: u64,
    /// Harness clock, monotonic nanoseconds.
    pub release_ns: u64,
    pub deadline_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub deadline_missed: bool,
    /// Device clock, nanoseconds; zero when the window never completed.
    pub t_in: u64,
    pub t_start: u64,
    pub t_end: u64,
    pub t_first_tx: u64,
    pub t_last_tx: u64,
    pub window: u32,
    pub hop: u32,
    pub channels: u32,
    pub fs: f32,
    pub load_profile: String,
    pub repeat: u32,
    pub warmup: bool,
    pub adapter: String,
    /// Error tag for windows that failed (e.g. "timeout"); None otherwise.
    pub error: Option<String>,
}

impl WindowRecord {
    /// Harness-observed completion latency.
    pub fn latency_us(&self) -> i64 {
        (self.end_ns as i64 - self.release_ns as i64) / 1_000
    }

    /// True when this row participates in summary statistics.
    pub fn measured(&self) -> bool {
        !self.warmup && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryFormat {
    Jsonl,
    Csv,
}

impl TelemetryFormat {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "jsonl" => Ok(TelemetryFormat::Jsonl),
            "csv" => Ok(TelemetryFormat::Csv),
            other => anyhow::bail!("unknown telemetry format {other:?} (jsonl|csv)"),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TelemetryFormat::Jsonl => "jsonl",
            TelemetryFormat::Csv => "csv",
        }
    }
}

const CSV_HEADER: &str = "run_id,plugin,dtype,window_index,release_ns,deadline_ns,start_ns,\
end_ns,deadline_missed,t_in,t_start,t_end,t_first_tx,t_last_tx,window,hop,channels,fs,\
load_profile,repeat,warmup,adapter,error";

/// Append-only per-run telemetry file.
pub struct TelemetryWriter {
    out: BufWriter<File>,
    format: TelemetryFormat,
}

impl TelemetryWriter {
    pub fn create(path: &Path, format: TelemetryFormat) -> io::Result<Self> {
        let mut writer = Self {
            out: BufWriter::new(File::create(path)?),
            format,
        };
        if format == TelemetryFormat::Csv {
            writeln!(writer.out, "{CSV_HEADER}")?;
        }
        Ok(writer)
    }

    pub fn append(&mut self, rec: &WindowRecord) -> io::Result<()> {
        match self.format {
            TelemetryFormat::Jsonl => {
                serde_json::to_writer(&mut self.out, rec)?;
                self.out.write_all(b"\n")?;
            }
            TelemetryFormat::Csv => {
                writeln!(
                    self.out,
                    "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                    rec.run_id,
                    rec.plugin,
                    rec.dtype,
                    rec.window_index,
                    rec.release_ns,
                    rec.deadline_ns,
                    rec.start_ns,
                    rec.end_ns,
                    rec.deadline_missed as u8,
                    rec.t_in,
                    rec.t_start,
                    rec.t_end,
                    rec.t_first_tx,
                    rec.t_last_tx,
                    rec.window,
                    rec.hop,
                    rec.channels,
                    rec.fs,
                    rec.load_profile,
                    rec.repeat,
                    rec.warmup as u8,
                    rec.adapter,
                    rec.error.as_deref().unwrap_or(""),
                )?;
            }
        }
        Ok(())
    }

    /// Flush after every window so an abort still leaves complete rows.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

// ---------------------------------------------------------------------------
// Summary statistics
// ---------------------------------------------------------------------------

/// Per-run aggregate, written as a separate JSON file next to the records.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plugin: String,
    pub dtype: String,
    pub adapter: String,
    pub load_profile: String,
    pub repeat: u32,
    pub windows_total: u64,
    /// Rows included in the statistics (non-warmup, non-error).
    pub windows_measured: u64,
    pub windows_warmup: u64,
    pub windows_errored: u64,
    pub deadline_missed: u64,
    pub miss_rate_pct: f64,
    pub latency_mean_us: Option<f64>,
    pub latency_p50_us: Option<i64>,
    pub latency_p95_us: Option<i64>,
    pub latency_p99_us: Option<i64>,
    /// Jitter: p95 − p50 and p99 − p50.
    pub jitter_p95_us: Option<i64>,
    pub jitter_p99_us: Option<i64>,
    /// Cause of a premature end, if the run aborted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<String>,
}

/// Compute the summary over a run's records.
pub fn summarize(records: &[WindowRecord], abort: Option<String>) -> RunSummary {
    let (run_id, plugin, dtype, adapter, load_profile, repeat) = records
        .first()
        .map(|r| {
            (
                r.run_id.clone(),
                r.plugin.clone(),
                r.dtype.clone(),
                r.adapter.clone(),
                r.load_profile.clone(),
                r.repeat,
            )
        })
        .unwrap_or_default();

    let measured: Vec<&WindowRecord> = records.iter().filter(|r| r.measured()).collect();
    let missed = measured.iter().filter(|r| r.deadline_missed).count() as u64;
    let mut latencies: Vec<i64> = measured.iter().map(|r| r.latency_us()).collect();
    latencies.sort_unstable();

    let pct = |p: usize| -> Option<i64> {
        if latencies.is_empty() {
            return None;
        }
        let n = latencies.len();
        Some(latencies[(n * p / 100).min(n - 1)])
    };
    let p50 = pct(50);
    let p95 = pct(95);
    let p99 = pct(99);
    let mean = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<i64>() as f64 / latencies.len() as f64)
    };

    RunSummary {
        run_id,
        plugin,
        dtype,
        adapter,
        load_profile,
        repeat,
        windows_total: records.len() as u64,
        windows_measured: measured.len() as u64,
        windows_warmup: records.iter().filter(|r| r.warmup).count() as u64,
        windows_errored: records.iter().filter(|r| r.error.is_some()).count() as u64,
        deadline_missed: missed,
        miss_rate_pct: if measured.is_empty() {
            0.0
        } else {
            missed as f64 / measured.len() as f64 * 100.0
        },
        latency_mean_us: mean,
        latency_p50_us: p50,
        latency_p95_us: p95,
        latency_p99_us: p99,
        jitter_p95_us: p95.zip(p50).map(|(a, b)| a - b),
        jitter_p99_us: p99.zip(p50).map(|(a, b)| a - b),
        abort,
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, latency_us: i64, warmup: bool, missed: bool) -> WindowRecord {
        WindowRecord {
            run_id: "noop-f32-r0".into(),
            plugin: "noop".into(),
            dtype: "f32".into(),
            window_index: index,
            release_ns: 1_000_000 * index,
            deadline_ns: 1_000_000 * index + 500_000_000,
            start_ns: 1_000_000 * index + 1,
            end_ns: 1_000_000 * index + (latency_us as u64) * 1_000,
            deadline_missed: missed,
            t_in: 10,
            t_start: 11,
            t_end: 12,
            t_first_tx: 13,
            t_last_tx: 14,
            window: 160,
            hop: 80,
            channels: 64,
            fs: 160.0,
            load_profile: "idle".into(),
            repeat: 0,
            warmup,
            adapter: "posix".into(),
            error: None,
        }
    }

    #[test]
    fn test_summary_percentiles_and_jitter() {
        // 100 measured rows with latencies 1..=100 µs.
        let records: Vec<WindowRecord> =
            (1..=100).map(|i| record(i, i as i64, false, false)).collect();
        let s = summarize(&records, None);
        assert_eq!(s.windows_total, 100);
        assert_eq!(s.windows_measured, 100);
        assert_eq!(s.latency_p50_us, Some(51));
        assert_eq!(s.latency_p95_us, Some(96));
        assert_eq!(s.latency_p99_us, Some(100));
        assert_eq!(s.jitter_p95_us, Some(45));
        assert_eq!(s.jitter_p99_us, Some(49));
        assert!((s.latency_mean_us.unwrap() - 50.5).abs() < 0.01);
        assert_eq!(s.miss_rate_pct, 0.0);
    }

    #[test]
    fn test_summary_excludes_warmup_and_errors() {
        let mut records: Vec<WindowRecord> = Vec::new();
        for i in 0..5 {
            records.push(record(i, 1_000_000, true, false)); // warmup outliers
        }
        for i in 5..15 {
            records.push(record(i, 100, false, false));
        }
        let mut errored = record(15, 0, false, true);
        errored.error = Some("timeout".into());
        records.push(errored);

        let s = summarize(&records, None);
        assert_eq!(s.windows_total, 16);
        assert_eq!(s.windows_measured, 10);
        assert_eq!(s.windows_warmup, 5);
        assert_eq!(s.windows_errored, 1);
        assert_eq!(s.latency_p50_us, Some(100));
        assert_eq!(s.deadline_missed, 0);
    }

    #[test]
    fn test_summary_miss_rate() {
        let mut records: Vec<WindowRecord> =
            (0..8).map(|i| record(i, 100, false, false)).collect();
        records.push(record(8, 900_000, false, true));
        records.push(record(9, 900_000, false, true));
        let s = summarize(&records, None);
        assert_eq!(s.deadline_missed, 2);
        assert!((s.miss_rate_pct - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_run_summary() {
        let s = summarize(&[], Some("conn_reset".into()));
        assert_eq!(s.windows_total, 0);
        assert!(s.latency_p50_us.is_none());
        assert_eq!(s.abort.as_deref(), Some("conn_reset"));
    }

    #[test]
    fn test_jsonl_writer_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let mut w = TelemetryWriter::create(&path, TelemetryFormat::Jsonl).unwrap();
        for i in 0..3 {
            w.append(&record(i, 50, false, false)).unwrap();
        }
        w.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["window_index"], i as u64);
            assert_eq!(v["plugin"], "noop");
            assert_eq!(v["warmup"], false);
        }
    }

    #[test]
    fn test_csv_writer_header_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut w = TelemetryWriter::create(&path, TelemetryFormat::Csv).unwrap();
        let mut rec = record(0, 50, true, false);
        rec.error = Some("timeout".into());
        w.append(&rec).unwrap();
        w.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("run_id,plugin,dtype,window_index"));
        let cols: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(cols.len(), lines[0].split(',').count());
        assert_eq!(cols[1], "noop");
        assert_eq!(cols[20], "1"); // warmup flag
        assert_eq!(cols[22], "timeout");
    }
}
