//! Run orchestration: one kernel per adapter process, kernels in sequence.
//!
//! A benchmark is `kernels × repeats` independent runs. Each run spawns (or
//! connects to) a fresh adapter, handshakes, streams the dataset through
//! the scheduler, and ends with an orderly teardown that reaps the adapter.
//! Per-run state — run id, telemetry writer, device session — is carried
//! explicitly; nothing survives in globals between runs.

use crate::config::RunConfig;
use crate::device::{DeviceComm, SessionParams};
use crate::load::LoadProfile;
use crate::plugin::{CalibrationState, Dtype, PluginId, Registry};
use crate::replayer::{self, ReplayConfig, SampleSource};
use crate::scheduler::{self, RunContext, SchedulerConfig};
use crate::telemetry::{self, RunSummary, TelemetryFormat, TelemetryWriter};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

/// Run every configured kernel, sequentially, and return the summaries.
/// A run that aborts is reported in its summary; a run that cannot even be
/// set up (bad config, missing binary) is logged and skipped.
pub fn run_benchmark(cfg: &RunConfig) -> Result<Vec<RunSummary>> {
    cfg.validate()?;
    if cfg.kernels.is_empty() {
        bail!("no kernels configured (or KERNEL_FILTER removed them all)");
    }
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("create output dir {}", cfg.output_dir.display()))?;

    let mut summaries = Vec::new();
    for kernel_uri in &cfg.kernels {
        for repeat in 0..cfg.repeats {
            match run_kernel_once(cfg, kernel_uri, repeat) {
                Ok(summary) => {
                    info!(
                        run_id = %summary.run_id,
                        p50_us = summary.latency_p50_us,
                        p99_us = summary.latency_p99_us,
                        miss_pct = summary.miss_rate_pct,
                        abort = summary.abort.as_deref().unwrap_or("-"),
                        "run finished"
                    );
                    summaries.push(summary);
                }
                Err(e) => {
                    error!(kernel = %kernel_uri, repeat, "run setup failed: {e:#}");
                }
            }
        }
    }
    Ok(summaries)
}

/// One kernel, one adapter process, one telemetry file.
pub fn run_kernel_once(cfg: &RunConfig, kernel_uri: &str, repeat: u32) -> Result<RunSummary> {
    let (kernel_name, dtype) = kernel_display(kernel_uri)?;
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
    let run_id = format!("{kernel_name}-{}-{stamp}-r{repeat}", dtype.name());

    // Calibration state, if a file is configured for this kernel.
    let calibration = load_calibration(cfg, &kernel_name)?;

    let mut params = SessionParams::new(cfg.fs, cfg.window, cfg.hop, cfg.channels, kernel_uri);
    params.dtype = dtype;
    params.params = cfg.params.clone();
    params.calibration = calibration;
    params.window_timeout_ms = cfg.window_timeout_ms;

    let mut device = if cfg.transport == "local://" {
        let bin = adapter_binary(cfg)?;
        DeviceComm::spawn(&bin, &[], params)?
    } else {
        DeviceComm::connect(&cfg.transport, params)?
    };

    let load_profile: LoadProfile = cfg.load_profile.parse()?;
    let _load = load_profile.start();

    let format = TelemetryFormat::from_name(&cfg.format)?;
    let telemetry_path = cfg
        .output_dir
        .join(format!("{run_id}.{}", format.extension()));
    let mut writer = TelemetryWriter::create(&telemetry_path, format)
        .with_context(|| format!("create telemetry file {}", telemetry_path.display()))?;

    let replay_cfg = ReplayConfig {
        fs: cfg.fs,
        channels: cfg.channels as u32,
        hop: cfg.hop,
        duration_secs: cfg.duration_secs,
        source: match &cfg.dataset {
            Some(path) => SampleSource::File(path.clone()),
            None => SampleSource::Zeros,
        },
        loop_input: cfg.loop_input,
    };
    let (hop_tx, hop_rx) = crossbeam_channel::bounded(64);
    let replayer_handle = replayer::spawn(replay_cfg, hop_tx)?;

    let sched_cfg = SchedulerConfig {
        window: cfg.window,
        hop: cfg.hop,
        channels: cfg.channels as u32,
        fs: cfg.fs,
        warmup_windows: cfg.warmup_windows,
        timeout_budget: cfg.timeout_budget,
        rt_priority: cfg.rt_priority,
        pin_core: cfg.pin_core,
    };
    let ctx = RunContext {
        run_id: run_id.clone(),
        plugin: kernel_uri.to_string(),
        dtype: dtype.name().to_string(),
        load_profile: cfg.load_profile.clone(),
        repeat,
        adapter: device.adapter_name().to_string(),
    };

    info!(
        run_id = %run_id,
        transport = %cfg.transport,
        adapter = %ctx.adapter,
        "run starting"
    );
    let (records, abort) = scheduler::run_dispatch_loop(&hop_rx, &mut device, &mut writer, &sched_cfg, &ctx);

    // Drop the receiver so a still-running replayer unblocks and exits,
    // then tear the adapter down and reap it.
    drop(hop_rx);
    let _ = replayer_handle.join();
    device.shutdown(2_000);
    writer.flush().ok();

    let summary = telemetry::summarize(&records, abort);
    let summary_path = cfg.output_dir.join(format!("{run_id}.summary.json"));
    telemetry::write_summary(&summary_path, &summary)?;
    Ok(summary)
}

/// Offline calibration: form training windows from the configured dataset
/// (zeros if none) and write `<kernel>.cal` into the calibration directory.
pub fn calibrate_kernel(cfg: &RunConfig, kernel_uri: &str, training_windows: usize) -> Result<PathBuf> {
    let (kernel_name, dtype) = kernel_display(kernel_uri)?;
    let dir = cfg
        .calibration_dir
        .clone()
        .unwrap_or_else(|| cfg.output_dir.clone());
    std::fs::create_dir_all(&dir)?;

    let window_len = cfg.window as usize * cfg.channels as usize;
    let windows: Vec<Vec<f32>> = match &cfg.dataset {
        Some(path) => {
            let data = replayer::load_dataset(path, cfg.channels as u32)?;
            data.chunks_exact(window_len)
                .take(training_windows)
                .map(|w| w.to_vec())
                .collect()
        }
        None => vec![vec![0f32; window_len]; training_windows],
    };
    if windows.is_empty() {
        bail!("dataset too small for even one training window");
    }

    let kernel_cfg = crate::plugin::KernelConfig {
        abi_version: crate::plugin::ABI_VERSION,
        fs: cfg.fs,
        window: cfg.window,
        hop: cfg.hop,
        channels: cfg.channels as u32,
        dtype,
        in_place: false,
        params: &cfg.params,
        calibration: None,
    };
    let registry = Registry::builtin();
    let (blob, state_version) = registry.calibrate(kernel_uri, &kernel_cfg, &windows)?;
    let state = CalibrationState::new(state_version, blob);

    let path = dir.join(format!("{kernel_name}.cal"));
    state.write_file(&path)?;
    info!(
        kernel = %kernel_uri,
        windows = windows.len(),
        bytes = state.data.len(),
        path = %path.display(),
        "calibration state written"
    );
    Ok(path)
}

fn kernel_display(kernel_uri: &str) -> Result<(String, Dtype)> {
    match PluginId::parse(kernel_uri)? {
        PluginId::Builtin { name, dtype } => Ok((name, dtype)),
        PluginId::Library(path) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "plugin".into());
            Ok((stem, Dtype::F32))
        }
    }
}

fn load_calibration(cfg: &RunConfig, kernel_name: &str) -> Result<Vec<u8>> {
    let Some(dir) = &cfg.calibration_dir else {
        return Ok(Vec::new());
    };
    let path = dir.join(format!("{kernel_name}.cal"));
    if !path.exists() {
        return Ok(Vec::new());
    }
    let state = CalibrationState::read_file(&path)?;
    if state.abi_version != crate::plugin::ABI_VERSION {
        bail!(
            "calibration state {} was written for ABI {}, harness speaks {}",
            path.display(),
            state.abi_version,
            crate::plugin::ABI_VERSION
        );
    }
    info!(
        kernel = kernel_name,
        bytes = state.data.len(),
        state_version = state.state_version,
        "calibration state loaded"
    );
    Ok(state.data)
}

/// Default adapter binary: `cortex-adapter` next to the running executable.
fn adapter_binary(cfg: &RunConfig) -> Result<PathBuf> {
    if let Some(bin) = &cfg.adapter_bin {
        return Ok(bin.clone());
    }
    let exe = std::env::current_exe().context("locate current executable")?;
    let dir = exe
        .parent()
        .context("executable has no parent directory")?;
    let candidate = dir.join("cortex-adapter");
    if candidate.exists() {
        Ok(candidate)
    } else {
        bail!(
            "no adapter binary at {}; set adapter_bin in the config",
            candidate.display()
        )
    }
}
