//! cortex-rt — measurement engine for real-time signal-processing kernels.
//!
//! Streams windowed multichannel f32 data to a kernel hosted in a separate
//! adapter process, enforces per-window deadlines, and records structured
//! per-window telemetry from both the harness clock and the device clock.
//! All kernel execution flows through the same versioned, CRC-framed wire
//! protocol — local and remote kernels are measured by one methodology.
//!
//! Layering, leaves first: [`bytes`] (endian + CRC) → [`transport`] (byte
//! streams with timeouts) → [`wire`] (framing + chunking) → [`plugin`]
//! (kernel ABI) → [`adapter`] / [`device`] (the two protocol endpoints) →
//! [`replayer`] / [`scheduler`] / [`telemetry`] → [`runner`].

pub mod adapter;
pub mod bytes;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod load;
pub mod plugin;
pub mod replayer;
pub mod runner;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod wire;

pub use config::RunConfig;
pub use error::{KernelError, ProtocolError, TransportError};
pub use plugin::Registry;
