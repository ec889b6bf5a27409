//! Replayer: streams hop-sized chunks at wall-clock cadence.
//!
//! Reads a raw interleaved-f32 little-endian file (one element = one sample
//! across all C channels, no header) and emits successive H-sample hops at
//! the rate H/Fs on a dedicated thread, feeding the scheduler through a
//! bounded channel. If the host slept past a release target the hop is
//! emitted anyway — samples are never skipped. A file shorter than the
//! requested duration loops; with no file configured, zeros are synthesized
//! so loopback measurement needs no dataset.

use crate::bytes::f32_from_le_bytes;
use crate::clock;
use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Where the replayer gets its samples.
#[derive(Debug, Clone)]
pub enum SampleSource {
    /// Raw interleaved-f32 LE file.
    File(PathBuf),
    /// All-zero synthetic signal.
    Zeros,
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub fs: f32,
    pub channels: u32,
    pub hop: u32,
    /// Total run length in seconds; determines the hop count.
    pub duration_secs: f64,
    pub source: SampleSource,
    /// Loop a file shorter than the run instead of stopping early.
    pub loop_input: bool,
}

impl ReplayConfig {
    pub fn hop_count(&self) -> u64 {
        ((self.duration_secs * self.fs as f64) / self.hop as f64).ceil() as u64
    }

    pub fn hop_period_ns(&self) -> u64 {
        (self.hop as f64 / self.fs as f64 * 1e9) as u64
    }

    fn hop_len(&self) -> usize {
        self.hop as usize * self.channels as usize
    }
}

/// One hop of interleaved samples plus its actual emission time.
#[derive(Debug, Clone)]
pub struct Hop {
    pub index: u64,
    /// Monotonic time the hop left the replayer (post-sleep).
    pub release_ns: u64,
    /// `hop × channels` interleaved samples.
    pub samples: Vec<f32>,
}

/// Load an entire raw-f32 dataset into memory.
///
/// The file length must be a whole number of samples (multiples of
/// `4 × channels` bytes).
pub fn load_dataset(path: &Path, channels: u32) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("read dataset {}", path.display()))?;
    let stride = channels as usize * 4;
    if bytes.is_empty() || bytes.len() % stride != 0 {
        bail!(
            "dataset {} is {} bytes, not a multiple of {} ({}ch × f32)",
            path.display(),
            bytes.len(),
            stride,
            channels
        );
    }
    let mut samples = vec![0f32; bytes.len() / 4];
    f32_from_le_bytes(&bytes, &mut samples);
    Ok(samples)
}

/// Start the replayer thread. Stops after `hop_count` hops or when the
/// receiver hangs up, whichever comes first.
pub fn spawn(config: ReplayConfig, tx: Sender<Hop>) -> Result<JoinHandle<()>> {
    let data = match &config.source {
        SampleSource::File(path) => {
            let data = load_dataset(path, config.channels)?;
            let secs = data.len() as f64 / config.channels as f64 / config.fs as f64;
            info!(
                dataset = %path.display(),
                samples = data.len() / config.channels as usize,
                seconds = format_args!("{secs:.1}"),
                "dataset loaded"
            );
            if !config.loop_input && secs < config.duration_secs {
                warn!(
                    "dataset covers {secs:.1}s of a {:.1}s run and looping is off; \
                     the run will end early",
                    config.duration_secs
                );
            }
            data
        }
        SampleSource::Zeros => Vec::new(),
    };

    let handle = std::thread::Builder::new()
        .name("replayer".into())
        .spawn(move || run_loop(&config, &data, &tx))
        .context("spawn replayer thread")?;
    Ok(handle)
}

fn run_loop(config: &ReplayConfig, data: &[f32], tx: &Sender<Hop>) {
    let hop_len = config.hop_len();
    let period_ns = config.hop_period_ns();
    let total_hops = config.hop_count();
    let start_ns = clock::now_ns();
    // Read position in samples-across-channels (file element) units.
    let mut pos = 0usize;
    let data_elems = data.len() / config.channels.max(1) as usize;

    for index in 0..total_hops {
        let target_ns = start_ns + index * period_ns;
        clock::sleep_until(target_ns);

        let mut samples = vec![0f32; hop_len];
        if !data.is_empty() {
            let c = config.channels as usize;
            for row in 0..config.hop as usize {
                if pos >= data_elems {
                    if !config.loop_input {
                        debug!(hops = index, "dataset exhausted");
                        return;
                    }
                    pos = 0;
                }
                let src = pos * c;
                samples[row * c..(row + 1) * c].copy_from_slice(&data[src..src + c]);
                pos += 1;
            }
        }

        let hop = Hop {
            index,
            release_ns: clock::now_ns(),
            samples,
        };
        // Blocking send: if the scheduler stalls, backpressure holds the
        // replayer rather than ballooning memory; the stall shows up as
        // missed deadlines, which is exactly what happened.
        if tx.send(hop).is_err() {
            debug!(hops = index, "scheduler hung up, replayer stopping");
            return;
        }
    }
    debug!(hops = total_hops, "replay complete");
}
