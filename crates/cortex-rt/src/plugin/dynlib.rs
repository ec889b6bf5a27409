//! Dynamically loaded kernels: the C ABI and its safe wrapper.
//!
//! A kernel library exports four `extern "C"` entry points; `calibrate` is
//! optional and its absence marks the kernel stateless-or-pre-trained.
//! Forward compatibility rides on `struct_size`: a kernel built against an
//! older revision of [`RawKernelConfig`] must reject a smaller
//! `struct_size` than it expects and ignore appended fields it does not
//! know, so a newer host keeps working with older plugins.
//!
//! The host never frees kernel memory directly — all teardown goes through
//! the library's own entry point, exactly once.

use crate::error::KernelError;
use crate::plugin::{Kernel, KernelConfig, KernelInstance, ABI_VERSION};
use std::os::raw::c_void;
use std::path::Path;
use std::sync::Arc;

pub const SYM_INIT: &[u8] = b"cortex_kernel_init\0";
pub const SYM_PROCESS: &[u8] = b"cortex_kernel_process\0";
pub const SYM_TEARDOWN: &[u8] = b"cortex_kernel_teardown\0";
pub const SYM_CALIBRATE: &[u8] = b"cortex_kernel_calibrate\0";

/// Largest calibration blob a dynamic kernel may produce.
pub const MAX_DYN_STATE_BYTES: usize = 48 * 1024;

/// Config record passed across the C boundary. Pointers are valid only for
/// the duration of the call; kernels copy what they retain.
#[repr(C)]
pub struct RawKernelConfig {
    pub abi_version: u32,
    pub struct_size: u32,
    pub fs: f32,
    pub window: u32,
    pub hop: u32,
    pub channels: u32,
    pub dtype: u32,
    pub in_place: u8,
    pub _pad: [u8; 3],
    pub params: *const u8,
    pub params_len: usize,
    pub calibration: *const u8,
    pub calibration_len: usize,
}

/// Out-record filled by `cortex_kernel_init`.
#[repr(C)]
pub struct RawKernelInfo {
    pub handle: *mut c_void,
    pub out_window: u32,
    pub out_channels: u32,
    pub capabilities: u32,
    pub _pad: u32,
}

type RawInitFn = unsafe extern "C" fn(*const RawKernelConfig, *mut RawKernelInfo) -> i32;
type RawProcessFn =
    unsafe extern "C" fn(*mut c_void, *const f32, usize, *mut f32, usize) -> i32;
type RawTeardownFn = unsafe extern "C" fn(*mut c_void);
type RawCalibrateFn = unsafe extern "C" fn(
    *const RawKernelConfig,
    *const f32,
    usize, // window count
    usize, // samples per window
    *mut u8,
    usize, // state capacity
    *mut usize,
    *mut u32,
) -> i32;

/// An opened kernel library with its entry points resolved.
pub struct DynPlugin {
    // Field order matters: fn pointers must die before the library unmaps.
    init_fn: RawInitFn,
    process_fn: RawProcessFn,
    teardown_fn: RawTeardownFn,
    calibrate_fn: Option<RawCalibrateFn>,
    _lib: libloading::Library,
}

impl DynPlugin {
    pub fn open(path: &Path) -> Result<Arc<Self>, KernelError> {
        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| KernelError::InitFailed(format!("dlopen {path:?}: {e}")))?;
        unsafe {
            let init_fn = *lib
                .get::<RawInitFn>(SYM_INIT)
                .map_err(|e| KernelError::InitFailed(format!("missing init symbol: {e}")))?;
            let process_fn = *lib
                .get::<RawProcessFn>(SYM_PROCESS)
                .map_err(|e| KernelError::InitFailed(format!("missing process symbol: {e}")))?;
            let teardown_fn = *lib
                .get::<RawTeardownFn>(SYM_TEARDOWN)
                .map_err(|e| KernelError::InitFailed(format!("missing teardown symbol: {e}")))?;
            // Optional: absence means stateless-or-pre-trained.
            let calibrate_fn = lib.get::<RawCalibrateFn>(SYM_CALIBRATE).ok().map(|s| *s);
            Ok(Arc::new(Self {
                init_fn,
                process_fn,
                teardown_fn,
                calibrate_fn,
                _lib: lib,
            }))
        }
    }

    fn raw_config(cfg: &KernelConfig) -> RawKernelConfig {
        RawKernelConfig {
            abi_version: ABI_VERSION,
            struct_size: std::mem::size_of::<RawKernelConfig>() as u32,
            fs: cfg.fs,
            window: cfg.window,
            hop: cfg.hop,
            channels: cfg.channels,
            dtype: cfg.dtype.tag() as u32,
            in_place: cfg.in_place as u8,
            _pad: [0; 3],
            params: cfg.params.as_ptr(),
            params_len: cfg.params.len(),
            calibration: cfg
                .calibration
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null()),
            calibration_len: cfg.calibration.map(|c| c.len()).unwrap_or(0),
        }
    }

    /// Run the library's `init` and wrap the returned handle.
    pub fn into_instance(
        self: Arc<Self>,
        cfg: &KernelConfig,
    ) -> Result<KernelInstance, KernelError> {
        let raw = Self::raw_config(cfg);
        let mut info = RawKernelInfo {
            handle: std::ptr::null_mut(),
            out_window: 0,
            out_channels: 0,
            capabilities: 0,
            _pad: 0,
        };
        let rc = unsafe { (self.init_fn)(&raw, &mut info) };
        if rc != 0 || info.handle.is_null() {
            return Err(KernelError::InitFailed(format!("plugin init returned {rc}")));
        }
        if info.out_window == 0 || info.out_channels == 0 {
            unsafe { (self.teardown_fn)(info.handle) };
            return Err(KernelError::InitFailed("plugin reported empty output shape".into()));
        }
        Ok(KernelInstance {
            out_window: info.out_window,
            out_channels: info.out_channels,
            capabilities: info.capabilities,
            kernel: Box::new(DynKernel {
                plugin: self,
                handle: info.handle,
            }),
        })
    }

    /// Offline calibration through the optional entry point.
    pub fn calibrate(
        self: Arc<Self>,
        cfg: &KernelConfig,
        training_windows: &[Vec<f32>],
    ) -> Result<(Vec<u8>, u32), KernelError> {
        let calibrate_fn = self.calibrate_fn.ok_or_else(|| {
            KernelError::InitFailed("plugin exports no calibrate entry point".into())
        })?;
        let samples_per_window = cfg.input_len();
        // The C side sees one contiguous [count × samples] block.
        let mut flat = Vec::with_capacity(training_windows.len() * samples_per_window);
        for w in training_windows {
            if w.len() != samples_per_window {
                return Err(KernelError::BadState(format!(
                    "training window has {} samples, expected {samples_per_window}",
                    w.len()
                )));
            }
            flat.extend_from_slice(w);
        }
        let raw = Self::raw_config(cfg);
        let mut state = vec![0u8; MAX_DYN_STATE_BYTES];
        let mut state_len = 0usize;
        let mut state_version = 0u32;
        let rc = unsafe {
            calibrate_fn(
                &raw,
                flat.as_ptr(),
                training_windows.len(),
                samples_per_window,
                state.as_mut_ptr(),
                state.len(),
                &mut state_len,
                &mut state_version,
            )
        };
        if rc != 0 {
            return Err(KernelError::InitFailed(format!("plugin calibrate returned {rc}")));
        }
        if state_len > state.len() {
            return Err(KernelError::BadState(format!(
                "plugin reported {state_len} state bytes, capacity {}",
                state.len()
            )));
        }
        state.truncate(state_len);
        Ok((state, state_version))
    }
}

struct DynKernel {
    plugin: Arc<DynPlugin>,
    handle: *mut c_void,
}

// The handle is owned exclusively by this wrapper and only ever used from
// the adapter's single window-loop thread.
unsafe impl Send for DynKernel {}

impl Kernel for DynKernel {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), KernelError> {
        let rc = unsafe {
            (self.plugin.process_fn)(
                self.handle,
                input.as_ptr(),
                input.len(),
                output.as_mut_ptr(),
                output.len(),
            )
        };
        if rc != 0 {
            return Err(KernelError::ExecFailed(format!("plugin process returned {rc}")));
        }
        Ok(())
    }
}

impl Drop for DynKernel {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { (self.plugin.teardown_fn)(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}
