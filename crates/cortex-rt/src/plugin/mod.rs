//! Kernel plugin interface.
//!
//! A kernel is the signal-processing routine under measurement. Its
//! lifecycle is `init` → many `process` calls → teardown (drop), with an
//! optional offline `calibrate` phase that produces a serializable state
//! blob. `process` is the hermetic hot path: all memory is acquired in
//! `init`, and the call must not allocate, block, or touch the outside
//! world — the adapter owns logging and I/O.
//!
//! Kernels resolve from a plugin identifier: a registry name like
//! `primitives/kernels/v1/car@f32`, or a filesystem path to a dynamic
//! library exporting the C entry points in [`dynlib`].

pub mod dynlib;
pub mod kernels;
pub mod registry;
pub mod state;

pub use registry::Registry;
pub use state::CalibrationState;

use crate::error::KernelError;

/// Plugin interface revision spoken by this host.
pub const ABI_VERSION: u32 = 1;

/// Capability bit: kernel supports offline calibration.
pub const CAP_OFFLINE_CALIB: u32 = 1 << 0;

/// Numeric sample type. Only f32 is implemented; the tag travels end to end
/// so future dtypes extend the wire without a version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
}

impl Dtype {
    pub fn from_tag(tag: u8) -> Result<Self, KernelError> {
        match tag {
            1 => Ok(Dtype::F32),
            other => Err(KernelError::UnsupportedDtype(other)),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Dtype::F32 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
        }
    }
}

/// Everything `init` and `calibrate` are allowed to see. Lives only for the
/// duration of the call — kernels copy what they retain.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig<'a> {
    pub abi_version: u32,
    pub fs: f32,
    pub window: u32,
    pub hop: u32,
    pub channels: u32,
    pub dtype: Dtype,
    /// Harness permits input and output to alias.
    pub in_place: bool,
    /// Opaque plugin-parameter string.
    pub params: &'a str,
    /// Calibration state payload from a prior offline phase.
    pub calibration: Option<&'a [u8]>,
}

impl<'a> KernelConfig<'a> {
    /// Samples per input window (W × C).
    pub fn input_len(&self) -> usize {
        self.window as usize * self.channels as usize
    }
}

/// A live kernel. `process` reads `window × channels` input samples in
/// row-major (sample-major) order and fills the declared output shape.
pub trait Kernel: Send {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), KernelError>;
}

/// Result of `init`: the kernel plus its actual output shape, which may
/// differ from the input (reductions shrink W or C).
pub struct KernelInstance {
    pub kernel: Box<dyn Kernel>,
    pub out_window: u32,
    pub out_channels: u32,
    pub capabilities: u32,
}

impl KernelInstance {
    pub fn output_len(&self) -> usize {
        self.out_window as usize * self.out_channels as usize
    }
}

/// Parsed plugin identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginId {
    /// Registry entry: kernel name plus requested dtype.
    Builtin { name: String, dtype: Dtype },
    /// Dynamic library path, resolved through [`dynlib`].
    Library(std::path::PathBuf),
}

impl PluginId {
    /// Parse `primitives/kernels/v1/NAME@DTYPE` (any path-like prefix is
    /// accepted; only the final segment is interpreted) or a `.so`/`.dylib`
    /// path. A missing `@DTYPE` suffix defaults to f32.
    pub fn parse(spec_uri: &str) -> Result<Self, KernelError> {
        if spec_uri.ends_with(".so") || spec_uri.ends_with(".dylib") {
            return Ok(PluginId::Library(spec_uri.into()));
        }
        let last = spec_uri
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KernelError::UnknownKernel(spec_uri.into()))?;
        let (name, dtype) = match last.split_once('@') {
            Some((n, d)) => {
                let dtype = match d {
                    "f32" => Dtype::F32,
                    _ => return Err(KernelError::UnknownKernel(spec_uri.into())),
                };
                (n, dtype)
            }
            None => (last, Dtype::F32),
        };
        if name.is_empty() {
            return Err(KernelError::UnknownKernel(spec_uri.into()));
        }
        Ok(PluginId::Builtin {
            name: name.to_string(),
            dtype,
        })
    }
}
