//! Built-in measurement kernels.
//!
//! These are harness fixtures, not DSP references: they give every
//! deployment a known-cost kernel set for loopback baselines and for
//! exercising the calibration path. All of them allocate exclusively in
//! `init` and run `process` on pre-sized buffers.

use crate::bytes::{get_f32_le, put_f32_le};
use crate::error::KernelError;
use crate::plugin::{Kernel, KernelConfig, KernelInstance, CAP_OFFLINE_CALIB};

fn check_shapes(cfg: &KernelConfig) -> Result<(), KernelError> {
    if cfg.window == 0 || cfg.channels == 0 {
        return Err(KernelError::InitFailed("window and channels must be non-zero".into()));
    }
    if cfg.hop == 0 || cfg.hop > cfg.window {
        return Err(KernelError::InitFailed(format!(
            "hop {} outside 1..={}",
            cfg.hop, cfg.window
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// noop — copy-through, the latency floor
// ---------------------------------------------------------------------------

struct Noop;

impl Kernel for Noop {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), KernelError> {
        output.copy_from_slice(input);
        Ok(())
    }
}

pub fn noop_init(cfg: &KernelConfig) -> Result<KernelInstance, KernelError> {
    check_shapes(cfg)?;
    Ok(KernelInstance {
        kernel: Box::new(Noop),
        out_window: cfg.window,
        out_channels: cfg.channels,
        capabilities: 0,
    })
}

// ---------------------------------------------------------------------------
// car — common average reference
// ---------------------------------------------------------------------------

/// Subtracts the cross-channel mean from every sample. NaN channels are
/// excluded from the mean so one dead electrode does not poison the row.
struct Car {
    channels: usize,
}

impl Kernel for Car {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), KernelError> {
        for (row_in, row_out) in input
            .chunks_exact(self.channels)
            .zip(output.chunks_exact_mut(self.channels))
        {
            let mut sum = 0.0f32;
            let mut n = 0u32;
            for &v in row_in {
                if !v.is_nan() {
                    sum += v;
                    n += 1;
                }
            }
            let mean = if n > 0 { sum / n as f32 } else { 0.0 };
            for (o, &v) in row_out.iter_mut().zip(row_in) {
                *o = v - mean;
            }
        }
        Ok(())
    }
}

pub fn car_init(cfg: &KernelConfig) -> Result<KernelInstance, KernelError> {
    check_shapes(cfg)?;
    Ok(KernelInstance {
        kernel: Box::new(Car {
            channels: cfg.channels as usize,
        }),
        out_window: cfg.window,
        out_channels: cfg.channels,
        capabilities: 0,
    })
}

// ---------------------------------------------------------------------------
// decim — keep every second sample, halving W
// ---------------------------------------------------------------------------

struct Decim {
    channels: usize,
}

impl Kernel for Decim {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), KernelError> {
        let c = self.channels;
        for (i, row_out) in output.chunks_exact_mut(c).enumerate() {
            let start = 2 * i * c;
            row_out.copy_from_slice(&input[start..start + c]);
        }
        Ok(())
    }
}

pub fn decim_init(cfg: &KernelConfig) -> Result<KernelInstance, KernelError> {
    check_shapes(cfg)?;
    if cfg.window < 2 {
        return Err(KernelError::InitFailed("decim needs a window of at least 2".into()));
    }
    Ok(KernelInstance {
        kernel: Box::new(Decim {
            channels: cfg.channels as usize,
        }),
        out_window: cfg.window / 2,
        out_channels: cfg.channels,
        capabilities: 0,
    })
}

// ---------------------------------------------------------------------------
// baseline — trainable per-channel offset removal
// ---------------------------------------------------------------------------

/// State blob layout: `channels` little-endian f32 offsets.
pub const BASELINE_STATE_VERSION: u32 = 1;

struct Baseline {
    offsets: Vec<f32>,
}

impl Kernel for Baseline {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), KernelError> {
        let c = self.offsets.len();
        for (row_in, row_out) in input.chunks_exact(c).zip(output.chunks_exact_mut(c)) {
            for ((o, &v), &off) in row_out.iter_mut().zip(row_in).zip(&self.offsets) {
                *o = v - off;
            }
        }
        Ok(())
    }
}

pub fn baseline_init(cfg: &KernelConfig) -> Result<KernelInstance, KernelError> {
    check_shapes(cfg)?;
    let state = cfg.calibration.ok_or(KernelError::CalibrationRequired)?;
    let c = cfg.channels as usize;
    if state.len() != c * 4 {
        return Err(KernelError::BadState(format!(
            "expected {} offset bytes, got {}",
            c * 4,
            state.len()
        )));
    }
    let mut offsets = vec![0f32; c];
    for (i, slot) in offsets.iter_mut().enumerate() {
        *slot = get_f32_le(state, i * 4);
    }
    Ok(KernelInstance {
        kernel: Box::new(Baseline { offsets }),
        out_window: cfg.window,
        out_channels: cfg.channels,
        capabilities: CAP_OFFLINE_CALIB,
    })
}

/// Offline phase: per-channel mean over every training window. NaN samples
/// are excluded from the average.
pub fn baseline_calibrate(
    cfg: &KernelConfig,
    training_windows: &[Vec<f32>],
) -> Result<Vec<u8>, KernelError> {
    check_shapes(cfg)?;
    let c = cfg.channels as usize;
    let mut sums = vec![0f64; c];
    let mut counts = vec![0u64; c];
    for window in training_windows {
        if window.len() != cfg.input_len() {
            return Err(KernelError::BadState(format!(
                "training window has {} samples, expected {}",
                window.len(),
                cfg.input_len()
            )));
        }
        for row in window.chunks_exact(c) {
            for (ch, &v) in row.iter().enumerate() {
                if !v.is_nan() {
                    sums[ch] += v as f64;
                    counts[ch] += 1;
                }
            }
        }
    }
    let mut blob = vec![0u8; c * 4];
    for ch in 0..c {
        let mean = if counts[ch] > 0 {
            (sums[ch] / counts[ch] as f64) as f32
        } else {
            0.0
        };
        put_f32_le(&mut blob, ch * 4, mean);
    }
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Dtype;

    fn cfg(window: u32, channels: u32) -> KernelConfig<'static> {
        KernelConfig {
            abi_version: crate::plugin::ABI_VERSION,
            fs: 160.0,
            window,
            hop: window / 2,
            channels,
            dtype: Dtype::F32,
            in_place: false,
            params: "",
            calibration: None,
        }
    }

    #[test]
    fn test_noop_passes_through() {
        let c = cfg(4, 2);
        let mut inst = noop_init(&c).unwrap();
        let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut out = vec![0f32; 8];
        inst.kernel.process(&input, &mut out).unwrap();
        assert_eq!(out, input);
        assert_eq!((inst.out_window, inst.out_channels), (4, 2));
    }

    #[test]
    fn test_car_zero_mean_rows() {
        let c = cfg(2, 4);
        let mut inst = car_init(&c).unwrap();
        let input = vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0];
        let mut out = vec![0f32; 8];
        inst.kernel.process(&input, &mut out).unwrap();
        // Row 1 mean 2.5, row 2 mean 10.
        assert_eq!(&out[..4], &[-1.5, -0.5, 0.5, 1.5]);
        assert_eq!(&out[4..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_car_excludes_nan_from_mean() {
        let c = cfg(1, 3);
        let mut inst = car_init(&c).unwrap();
        let input = vec![f32::NAN, 2.0, 4.0];
        let mut out = vec![0f32; 3];
        inst.kernel.process(&input, &mut out).unwrap();
        // Mean over finite channels = 3.0.
        assert!(out[0].is_nan());
        assert_eq!(out[1], -1.0);
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn test_decim_halves_window() {
        let c = cfg(4, 2);
        let inst = decim_init(&c).unwrap();
        assert_eq!((inst.out_window, inst.out_channels), (2, 2));
        let mut inst = inst;
        let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut out = vec![0f32; 4];
        inst.kernel.process(&input, &mut out).unwrap();
        // Rows 0 and 2 survive.
        assert_eq!(out, vec![0.0, 1.0, 4.0, 5.0]);
    }

    #[test]
    fn test_baseline_requires_calibration() {
        let c = cfg(4, 2);
        match baseline_init(&c) {
            Err(KernelError::CalibrationRequired) => {}
            other => panic!("expected CalibrationRequired, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_baseline_calibrate_then_process() {
        let c = cfg(2, 2);
        // Channel means: ch0 = 1.0, ch1 = -2.0.
        let training = vec![
            vec![1.0f32, -2.0, 1.0, -2.0],
            vec![1.0f32, -2.0, 1.0, -2.0],
        ];
        let blob = baseline_calibrate(&c, &training).unwrap();
        assert_eq!(blob.len(), 8);

        let mut with_state = c;
        with_state.calibration = Some(&blob);
        let mut inst = baseline_init(&with_state).unwrap();
        assert_eq!(inst.capabilities & CAP_OFFLINE_CALIB, CAP_OFFLINE_CALIB);

        let input = vec![2.0f32, 0.0, 1.0, -2.0];
        let mut out = vec![0f32; 4];
        inst.kernel.process(&input, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_baseline_rejects_wrong_state_size() {
        let mut c = cfg(2, 2);
        let blob = vec![0u8; 5];
        c.calibration = Some(&blob);
        assert!(matches!(baseline_init(&c), Err(KernelError::BadState(_))));
    }

    #[test]
    fn test_process_deterministic() {
        let c = cfg(8, 4);
        let mut inst = car_init(&c).unwrap();
        let input: Vec<f32> = (0..32).map(|i| (i as f32).sin()).collect();
        let mut a = vec![0f32; 32];
        let mut b = vec![0f32; 32];
        inst.kernel.process(&input, &mut a).unwrap();
        inst.kernel.process(&input, &mut b).unwrap();
        // Bit-identical for identical inputs.
        assert_eq!(
            a.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }
}
