//! `cortex.toml` run configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level benchmark configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Plugin identifiers to benchmark, run strictly in sequence.
    #[serde(default)]
    pub kernels: Vec<String>,
    /// Raw interleaved-f32 LE dataset. Omit to stream zeros.
    #[serde(default)]
    pub dataset: Option<PathBuf>,
    /// Sample rate in Hz.
    #[serde(default = "RunConfig::default_fs")]
    pub fs: f32,
    /// Window length in samples.
    #[serde(default = "RunConfig::default_window")]
    pub window: u32,
    /// Hop length in samples; consecutive windows overlap by window − hop.
    #[serde(default = "RunConfig::default_hop")]
    pub hop: u32,
    #[serde(default = "RunConfig::default_channels")]
    pub channels: u16,
    /// Run length per kernel in seconds.
    #[serde(default = "RunConfig::default_duration_secs")]
    pub duration_secs: f64,
    /// Repetitions per kernel under identical conditions.
    #[serde(default = "RunConfig::default_repeats")]
    pub repeats: u32,
    /// Leading windows flagged warmup and excluded from statistics.
    #[serde(default = "RunConfig::default_warmup_windows")]
    pub warmup_windows: u32,
    /// Adapter transport: `local://` spawns the adapter binary; tcp/serial/
    /// shm URIs connect to a pre-running one.
    #[serde(default = "RunConfig::default_transport")]
    pub transport: String,
    /// Adapter binary for `local://`; defaults to `cortex-adapter` next to
    /// the harness executable.
    #[serde(default)]
    pub adapter_bin: Option<PathBuf>,
    /// Background load profile: idle, medium, or heavy.
    #[serde(default = "RunConfig::default_load_profile")]
    pub load_profile: String,
    /// Loop the dataset when shorter than the run.
    #[serde(default = "RunConfig::default_loop_input")]
    pub loop_input: bool,
    #[serde(default = "RunConfig::default_output_dir")]
    pub output_dir: PathBuf,
    /// Telemetry format: jsonl or csv.
    #[serde(default = "RunConfig::default_format")]
    pub format: String,
    /// Recoverable window timeouts tolerated per run.
    #[serde(default = "RunConfig::default_timeout_budget")]
    pub timeout_budget: u32,
    #[serde(default = "RunConfig::default_window_timeout_ms")]
    pub window_timeout_ms: u64,
    /// Opaque parameter string handed to every kernel's init.
    #[serde(default)]
    pub params: String,
    /// Directory of calibration state files, one `<kernel>.cal` per
    /// trainable kernel.
    #[serde(default)]
    pub calibration_dir: Option<PathBuf>,
    /// SCHED_FIFO priority for the dispatch thread (requires privilege).
    #[serde(default)]
    pub rt_priority: Option<i32>,
    /// CPU core to pin the dispatch thread to.
    #[serde(default)]
    pub pin_core: Option<usize>,
}

impl RunConfig {
    fn default_fs() -> f32 { 160.0 }
    fn default_window() -> u32 { 160 }
    fn default_hop() -> u32 { 80 }
    fn default_channels() -> u16 { 64 }
    fn default_duration_secs() -> f64 { 60.0 }
    fn default_repeats() -> u32 { 1 }
    fn default_warmup_windows() -> u32 { 10 }
    fn default_transport() -> String { "local://".into() }
    fn default_load_profile() -> String { "idle".into() }
    fn default_loop_input() -> bool { true }
    fn default_output_dir() -> PathBuf { "cortex-out".into() }
    fn default_format() -> String { "jsonl".into() }
    fn default_timeout_budget() -> u32 { 3 }
    fn default_window_timeout_ms() -> u64 { 10_000 }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 || self.hop == 0 || self.channels == 0 {
            anyhow::bail!("window, hop, and channels must be non-zero");
        }
        if self.hop > self.window {
            anyhow::bail!("hop {} exceeds window {}", self.hop, self.window);
        }
        if !(self.fs > 0.0) {
            anyhow::bail!("fs must be positive");
        }
        let window_bytes = self.window as u64 * self.channels as u64 * 4;
        if window_bytes > crate::wire::DEFAULT_MAX_WINDOW_BYTES as u64 {
            anyhow::bail!(
                "window of {window_bytes} bytes exceeds the {} byte maximum",
                crate::wire::DEFAULT_MAX_WINDOW_BYTES
            );
        }
        Ok(())
    }

    /// Returns a default config for the EEG loopback setup.
    pub fn default_example() -> Self {
        Self {
            kernels: vec![
                "primitives/kernels/v1/noop@f32".into(),
                "primitives/kernels/v1/car@f32".into(),
            ],
            dataset: None,
            fs: Self::default_fs(),
            window: Self::default_window(),
            hop: Self::default_hop(),
            channels: Self::default_channels(),
            duration_secs: Self::default_duration_secs(),
            repeats: Self::default_repeats(),
            warmup_windows: Self::default_warmup_windows(),
            transport: Self::default_transport(),
            adapter_bin: None,
            load_profile: Self::default_load_profile(),
            loop_input: Self::default_loop_input(),
            output_dir: Self::default_output_dir(),
            format: Self::default_format(),
            timeout_budget: Self::default_timeout_budget(),
            window_timeout_ms: Self::default_window_timeout_ms(),
            params: String::new(),
            calibration_dir: None,
            rt_priority: None,
            pin_core: None,
        }
    }

    /// Apply the recognized environment overrides in place.
    ///
    /// `KERNEL_FILTER` (regex over plugin identifiers), `DURATION_OVERRIDE`,
    /// `REPEATS_OVERRIDE`, `WARMUP_OVERRIDE`, `OUTPUT_DIR`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(pattern) = std::env::var("KERNEL_FILTER") {
            let re = regex::Regex::new(&pattern)
                .with_context(|| format!("KERNEL_FILTER {pattern:?} is not a valid regex"))?;
            let before = self.kernels.len();
            self.kernels.retain(|k| re.is_match(k));
            if self.kernels.len() != before {
                warn!(
                    pattern = %pattern,
                    kept = self.kernels.len(),
                    dropped = before - self.kernels.len(),
                    "KERNEL_FILTER applied"
                );
            }
        }
        if let Some(v) = parse_env::<f64>("DURATION_OVERRIDE")? {
            self.duration_secs = v;
        }
        if let Some(v) = parse_env::<u32>("REPEATS_OVERRIDE")? {
            self.repeats = v;
        }
        if let Some(v) = parse_env::<u32>("WARMUP_OVERRIDE")? {
            self.warmup_windows = v;
        }
        if let Ok(dir) = std::env::var("OUTPUT_DIR") {
            self.output_dir = dir.into();
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => Ok(Some(
            v.parse::<T>()
                .with_context(|| format!("{name}={v:?} is not valid"))?,
        )),
        Err(_) => Ok(None),
    }
}
