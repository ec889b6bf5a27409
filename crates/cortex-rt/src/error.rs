//! Error taxonomy for the transport, wire protocol, and kernel layers.
//!
//! Dispositions: `TransportError::Timeout` is the only recoverable kind in
//! the dispatch path (recorded as a missed window, run continues within the
//! timeout budget). Everything else aborts the run — mismatched CRCs,
//! sequences, and sessions indicate corruption or an adapter restart, not
//! transient loss.

use thiserror::Error;

/// Byte-stream transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No data arrived within the requested window.
    #[error("transport timeout")]
    Timeout,
    /// Peer closed the stream or the channel was lost.
    #[error("connection reset by peer")]
    ConnReset,
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts are the only transport kind the scheduler absorbs.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// Wire-protocol and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Received protocol version differs from 1. Exact match is required;
    /// negotiation is reserved for v2.
    #[error("protocol version mismatch: got {got}, need {need}")]
    VersionMismatch { got: u8, need: u8 },
    #[error("frame CRC mismatch")]
    CrcMismatch,
    /// Header advertises a payload larger than the single-frame maximum.
    #[error("frame payload of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: u32, max: u32 },
    /// Chunk offset or window index is not the one the receiver expects.
    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },
    /// LAST chunk arrived before the byte range was fully covered.
    #[error("chunked transfer incomplete: {received} of {total} bytes")]
    Incomplete { received: u32, total: u32 },
    /// Announced transfer does not fit the receive buffer.
    #[error("transfer of {needed} bytes exceeds buffer capacity {capacity}")]
    BufferTooSmall { needed: u32, capacity: u32 },
    /// RESULT carried a session id other than the one assigned in CONFIG —
    /// the adapter restarted mid-run.
    #[error("session mismatch: expected {expected:#018x}, got {got:#018x}")]
    SessionMismatch { expected: u64, got: u64 },
    /// A structurally valid frame of the wrong type for this protocol state.
    #[error("unexpected {got:?} frame while waiting for {expected}")]
    UnexpectedFrame {
        got: crate::wire::FrameType,
        expected: &'static str,
    },
    /// Peer reported a fatal condition via an ERROR frame.
    #[error("peer error {code}: {message}")]
    Remote { code: u32, message: String },
    /// Payload too short or a length field inconsistent with the frame.
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

impl ProtocolError {
    /// True only for the recoverable kind (transport timeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Transport(TransportError::Timeout))
    }

    /// Short tag written into the telemetry `error` column.
    pub fn tag(&self) -> &'static str {
        match self {
            ProtocolError::Transport(TransportError::Timeout) => "timeout",
            ProtocolError::Transport(TransportError::ConnReset) => "conn_reset",
            ProtocolError::Transport(TransportError::Io(_)) => "io",
            ProtocolError::VersionMismatch { .. } => "version_mismatch",
            ProtocolError::CrcMismatch => "crc_mismatch",
            ProtocolError::FrameTooLarge { .. } => "frame_too_large",
            ProtocolError::SequenceMismatch { .. } => "sequence_mismatch",
            ProtocolError::Incomplete { .. } => "incomplete",
            ProtocolError::BufferTooSmall { .. } => "buffer_too_small",
            ProtocolError::SessionMismatch { .. } => "session_mismatch",
            ProtocolError::UnexpectedFrame { .. } => "unexpected_frame",
            ProtocolError::Remote { .. } => "remote_error",
            ProtocolError::Malformed(_) => "malformed",
        }
    }
}

/// Kernel plugin failures, reported by `init`, `process`, or `calibrate`.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel init failed: {0}")]
    InitFailed(String),
    #[error("kernel execution failed: {0}")]
    ExecFailed(String),
    /// Trainable kernel started without calibration state.
    #[error("kernel requires calibration state")]
    CalibrationRequired,
    #[error("unsupported kernel ABI version {got} (host speaks {host})")]
    UnsupportedAbi { got: u32, host: u32 },
    #[error("unsupported dtype tag {0}")]
    UnsupportedDtype(u8),
    #[error("unknown kernel {0:?}")]
    UnknownKernel(String),
    #[error("calibration state rejected: {0}")]
    BadState(String),
}
