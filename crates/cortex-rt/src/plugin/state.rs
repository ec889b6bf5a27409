//! Calibration state files.
//!
//! Layout: a 16-byte header — magic "CORT", host ABI version, kernel-defined
//! state version, payload size — followed by the kernel-specific payload.
//! The container never interprets the payload; kernels validate their own
//! state in `init`.

use crate::bytes::{get_u32_le, put_u32_le};
use crate::plugin::ABI_VERSION;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// "CORT" = 0x434F5254.
pub const STATE_MAGIC: u32 = 0x434F_5254;
pub const STATE_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationState {
    pub abi_version: u32,
    pub state_version: u32,
    pub data: Vec<u8>,
}

impl CalibrationState {
    pub fn new(state_version: u32, data: Vec<u8>) -> Self {
        Self {
            abi_version: ABI_VERSION,
            state_version,
            data,
        }
    }

    /// Serialize header + payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; STATE_HEADER_LEN + self.data.len()];
        put_u32_le(&mut out, 0, STATE_MAGIC);
        put_u32_le(&mut out, 4, self.abi_version);
        put_u32_le(&mut out, 8, self.state_version);
        put_u32_le(&mut out, 12, self.data.len() as u32);
        out[STATE_HEADER_LEN..].copy_from_slice(&self.data);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STATE_HEADER_LEN {
            bail!("state file truncated: {} bytes", bytes.len());
        }
        let magic = get_u32_le(bytes, 0);
        if magic != STATE_MAGIC {
            bail!("bad state magic {magic:#010x}");
        }
        let abi_version = get_u32_le(bytes, 4);
        let state_version = get_u32_le(bytes, 8);
        let data_size = get_u32_le(bytes, 12) as usize;
        if bytes.len() != STATE_HEADER_LEN + data_size {
            bail!(
                "state payload size mismatch: header says {data_size}, file carries {}",
                bytes.len() - STATE_HEADER_LEN
            );
        }
        Ok(Self {
            abi_version,
            state_version,
            data: bytes[STATE_HEADER_LEN..].to_vec(),
        })
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())
            .with_context(|| format!("write calibration state {}", path.display()))
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read calibration state {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("parse calibration state {}", path.display()))
    }
}
