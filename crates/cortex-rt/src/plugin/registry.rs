//! Kernel resolution: static registry plus dynamic-library fallthrough.
//!
//! Embedded targets link their kernels statically and register them here;
//! hosted targets may also point a plugin identifier at a shared library,
//! which resolves through [`crate::plugin::dynlib`]. The registry does not
//! interpret kernel semantics beyond discovery.

use crate::error::KernelError;
use crate::plugin::{dynlib, kernels, KernelConfig, KernelInstance, PluginId};

pub type InitFn = fn(&KernelConfig) -> Result<KernelInstance, KernelError>;
pub type CalibrateFn = fn(&KernelConfig, &[Vec<f32>]) -> Result<Vec<u8>, KernelError>;

pub struct KernelEntry {
    pub name: &'static str,
    pub init: InitFn,
    /// Absent for stateless-or-pre-trained kernels.
    pub calibrate: Option<CalibrateFn>,
    /// Kernel-defined version of the calibration state layout.
    pub state_version: u32,
}

pub struct Registry {
    entries: Vec<KernelEntry>,
}

impl Registry {
    /// The built-in kernel set every adapter advertises.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                KernelEntry {
                    name: "noop",
                    init: kernels::noop_init,
                    calibrate: None,
                    state_version: 0,
                },
                KernelEntry {
                    name: "car",
                    init: kernels::car_init,
                    calibrate: None,
                    state_version: 0,
                },
                KernelEntry {
                    name: "decim",
                    init: kernels::decim_init,
                    calibrate: None,
                    state_version: 0,
                },
                KernelEntry {
                    name: "baseline",
                    init: kernels::baseline_init,
                    calibrate: Some(kernels::baseline_calibrate),
                    state_version: kernels::BASELINE_STATE_VERSION,
                },
            ],
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&KernelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Resolve a plugin identifier and run `init`.
    pub fn load(
        &self,
        spec_uri: &str,
        cfg: &KernelConfig,
    ) -> Result<KernelInstance, KernelError> {
        match PluginId::parse(spec_uri)? {
            PluginId::Builtin { name, dtype } => {
                if dtype != cfg.dtype {
                    return Err(KernelError::UnsupportedDtype(cfg.dtype.tag()));
                }
                let entry = self
                    .get(&name)
                    .ok_or_else(|| KernelError::UnknownKernel(spec_uri.into()))?;
                (entry.init)(cfg)
            }
            PluginId::Library(path) => dynlib::DynPlugin::open(&path)?.into_instance(cfg),
        }
    }

    /// Resolve a plugin identifier and run its offline calibration phase.
    pub fn calibrate(
        &self,
        spec_uri: &str,
        cfg: &KernelConfig,
        training_windows: &[Vec<f32>],
    ) -> Result<(Vec<u8>, u32), KernelError> {
        match PluginId::parse(spec_uri)? {
            PluginId::Builtin { name, .. } => {
                let entry = self
                    .get(&name)
                    .ok_or_else(|| KernelError::UnknownKernel(spec_uri.into()))?;
                let calibrate = entry.calibrate.ok_or_else(|| {
                    KernelError::InitFailed(format!("kernel {name:?} has no calibrate phase"))
                })?;
                let blob = calibrate(cfg, training_windows)?;
                Ok((blob, entry.state_version))
            }
            PluginId::Library(path) => {
                dynlib::DynPlugin::open(&path)?.calibrate(cfg, training_windows)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Dtype, ABI_VERSION};

    fn cfg() -> KernelConfig<'static> {
        KernelConfig {
            abi_version: ABI_VERSION,
            fs: 160.0,
            window: 160,
            hop: 80,
            channels: 64,
            dtype: Dtype::F32,
            in_place: false,
            params: "",
            calibration: None,
        }
    }

    #[test]
    fn test_builtin_names_advertised() {
        let names = Registry::builtin().names();
        assert_eq!(names, vec!["noop", "car", "decim", "baseline"]);
    }

    #[test]
    fn test_load_by_full_uri() {
        let reg = Registry::builtin();
        let inst = reg.load("primitives/kernels/v1/noop@f32", &cfg()).unwrap();
        assert_eq!((inst.out_window, inst.out_channels), (160, 64));
    }

    #[test]
    fn test_unknown_kernel_rejected() {
        let reg = Registry::builtin();
        match reg.load("primitives/kernels/v1/wavelet@f32", &cfg()) {
            Err(KernelError::UnknownKernel(_)) => {}
            other => panic!("expected UnknownKernel, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_calibrate_missing_phase_rejected() {
        let reg = Registry::builtin();
        assert!(reg.calibrate("noop", &cfg(), &[]).is_err());
    }

    #[test]
    fn test_calibrate_baseline_reports_state_version() {
        let reg = Registry::builtin();
        let training = vec![vec![0.5f32; 160 * 64]];
        let (blob, version) = reg.calibrate("baseline", &cfg(), &training).unwrap();
        assert_eq!(blob.len(), 64 * 4);
        assert_eq!(version, kernels::BASELINE_STATE_VERSION);
    }
}
