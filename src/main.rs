//! cortex-bench — benchmarking harness for real-time signal-processing kernels.
//!
//! Streams windowed sample data to kernels hosted in adapter processes,
//! measures per-window latency and deadline compliance, and writes
//! line-delimited telemetry plus per-run summaries. Run
//! `cortex-bench --help` for usage.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cortex_rt::RunConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "cortex-bench",
    version,
    about = "Benchmark real-time signal-processing kernels\n\nMeasure per-window latency and deadline compliance of kernels running behind the adapter protocol — locally spawned or remote.",
    long_about = None
)]
struct Cli {
    /// Path to cortex.toml config file
    #[clap(long, short, default_value = "cortex.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an example cortex.toml to stdout
    Init,

    /// Run the configured benchmark
    Run,

    /// Produce a calibration state file for a trainable kernel
    Calibrate {
        /// Plugin identifier (e.g. primitives/kernels/v1/baseline@f32)
        kernel: String,

        /// Number of training windows taken from the dataset
        #[clap(long, default_value = "32")]
        windows: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")),
        )
        .init();

    std::process::exit(match real_main() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    });
}

fn real_main() -> Result<i32> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Init) {
        let example = RunConfig::default_example();
        print!("{}", toml::to_string_pretty(&example)?);
        return Ok(0);
    }

    let mut config = match RunConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            eprintln!(
                "run `cortex-bench init > {}` to create one",
                cli.config.display()
            );
            return Ok(2);
        }
    };
    if let Err(e) = config.apply_env_overrides() {
        eprintln!("configuration error: {e:#}");
        return Ok(2);
    }

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Run => {
            let summaries = cortex_rt::runner::run_benchmark(&config)?;
            eprintln!();
            eprintln!("=== BENCH SUMMARY ({} runs) ===", summaries.len());
            for s in &summaries {
                eprintln!(
                    "  {}  p50={} µs  p95={} µs  p99={} µs  miss={:.1}%  windows={}{}",
                    s.run_id,
                    s.latency_p50_us.map(|v| v.to_string()).unwrap_or("—".into()),
                    s.latency_p95_us.map(|v| v.to_string()).unwrap_or("—".into()),
                    s.latency_p99_us.map(|v| v.to_string()).unwrap_or("—".into()),
                    s.miss_rate_pct,
                    s.windows_total,
                    s.abort
                        .as_deref()
                        .map(|a| format!("  ABORTED: {a}"))
                        .unwrap_or_default(),
                );
            }
            let aborted = summaries.iter().any(|s| s.abort.is_some());
            Ok(if aborted || summaries.is_empty() { 1 } else { 0 })
        }
        Commands::Calibrate { kernel, windows } => {
            let path = cortex_rt::runner::calibrate_kernel(&config, &kernel, windows)?;
            eprintln!("calibration state written to {}", path.display());
            Ok(0)
        }
    }
}
