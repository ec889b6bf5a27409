//! Versioned binary frame protocol.
//!
//! Every frame is a fixed 16-byte little-endian header followed by a typed
//! payload:
//!
//! | offset | field          | size |
//! |--------|----------------|------|
//! | 0      | magic "CRTX"   | u32  |
//! | 4      | version (=1)   | u8   |
//! | 5      | frame type     | u8   |
//! | 6      | flags (=0)     | u16  |
//! | 8      | payload length | u32  |
//! | 12     | crc32          | u32  |
//!
//! The CRC covers header bytes [0,12) plus the payload. Receivers hunt for
//! the magic before parsing, so a desynchronized stream recovers at the next
//! valid frame boundary; a resync may cross `recv` boundaries. Version 1
//! requires an exact version match — negotiation is reserved for v2.

mod payload;

pub mod chunk;

pub use payload::{Ack, ChunkHeader, Config, ErrorInfo, Hello, ResultHeader};

use crate::bytes::{crc32_update, get_u16_le, get_u32_le, put_u16_le, put_u32_le};
use crate::clock;
use crate::error::{ProtocolError, TransportError};
use crate::transport::Transport;

/// "CRTX" (0x43525458), stored little-endian on the wire.
pub const MAGIC: u32 = 0x4352_5458;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

/// Single-frame payload ceiling. Anything larger must be chunked.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024;
/// Sample-data bytes per chunk frame.
pub const MAX_CHUNK_DATA: usize = 8 * 1024;
/// Default ceiling for a whole window's byte size.
pub const DEFAULT_MAX_WINDOW_BYTES: u32 = 256 * 1024;

/// Wire error codes carried in ERROR frames.
pub mod error_code {
    pub const VERSION_MISMATCH: u32 = 1;
    pub const CRC_MISMATCH: u32 = 2;
    pub const SEQUENCE_MISMATCH: u32 = 3;
    pub const INCOMPLETE: u32 = 4;
    pub const BUFFER_TOO_SMALL: u32 = 5;
    pub const KERNEL_INIT_FAILED: u32 = 6;
    pub const KERNEL_EXEC_FAILED: u32 = 7;
    pub const CALIBRATION_TOO_BIG: u32 = 8;
    pub const BAD_CONFIG: u32 = 9;
    pub const UNKNOWN_KERNEL: u32 = 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Config = 0x02,
    Ack = 0x03,
    WindowChunk = 0x04,
    Result = 0x05,
    Error = 0x06,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => FrameType::Hello,
            0x02 => FrameType::Config,
            0x03 => FrameType::Ack,
            0x04 => FrameType::WindowChunk,
            0x05 => FrameType::Result,
            0x06 => FrameType::Error,
            _ => return None,
        })
    }
}

/// Serialize one frame into `out` (cleared first): header, CRC, payload.
pub fn encode_frame(out: &mut Vec<u8>, frame_type: FrameType, payload: &[u8]) {
    debug_assert!(payload.len() as u32 <= MAX_FRAME_PAYLOAD);
    out.clear();
    out.resize(HEADER_LEN, 0);
    put_u32_le(out, 0, MAGIC);
    out[4] = VERSION;
    out[5] = frame_type as u8;
    put_u16_le(out, 6, 0);
    put_u32_le(out, 8, payload.len() as u32);
    // CRC over the first 12 header bytes plus the payload; the CRC field
    // itself is excluded.
    let mut crc = 0xFFFF_FFFFu32;
    crc = crc32_update(crc, &out[..12]);
    crc = crc32_update(crc, payload);
    put_u32_le(out, 12, crc ^ 0xFFFF_FFFF);
    out.extend_from_slice(payload);
}

/// Encode and transmit one frame as a single transport send.
pub fn send_frame(
    transport: &mut dyn Transport,
    scratch: &mut Vec<u8>,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    encode_frame(scratch, frame_type, payload);
    transport.send_all(scratch)?;
    Ok(())
}

/// Incremental frame receiver with MAGIC resynchronization.
///
/// Owns a scratch buffer that persists across frames so the receive path
/// does not allocate per frame once warmed up. One call covers the whole
/// hunt-header-payload sequence under a single wall-clock deadline.
pub struct FrameReader {
    buf: Vec<u8>,
    /// Valid bytes in `buf` (always starting at index 0).
    filled: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; HEADER_LEN + MAX_FRAME_PAYLOAD as usize],
            filled: 0,
        }
    }

    /// Read the next complete frame, returning its type and payload range
    /// within the reader's buffer. `payload(range)` borrows the bytes.
    pub fn read_frame(
        &mut self,
        transport: &mut dyn Transport,
        timeout_ms: u64,
    ) -> Result<(FrameType, std::ops::Range<usize>), ProtocolError> {
        let deadline = clock::now_ns() + timeout_ms.saturating_mul(1_000_000);
        let magic_le = MAGIC.to_le_bytes();

        loop {
            // Hunt: discard everything before the first magic occurrence.
            // Trailing bytes that could be a magic prefix are kept.
            if self.filled > 0 {
                if let Some(pos) = find_subsequence(&self.buf[..self.filled], &magic_le) {
                    if pos > 0 {
                        self.consume(pos);
                    }
                } else {
                    let keep = self.filled.min(magic_le.len() - 1);
                    self.consume(self.filled - keep);
                }
            }

            if self.filled >= HEADER_LEN && get_u32_le(&self.buf, 0) == MAGIC {
                let version = self.buf[4];
                if version != VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        got: version,
                        need: VERSION,
                    });
                }
                let raw_type = self.buf[5];
                let _flags = get_u16_le(&self.buf, 6);
                let payload_len = get_u32_le(&self.buf, 8);
                if payload_len > MAX_FRAME_PAYLOAD {
                    return Err(ProtocolError::FrameTooLarge {
                        len: payload_len,
                        max: MAX_FRAME_PAYLOAD,
                    });
                }
                let total = HEADER_LEN + payload_len as usize;
                if self.filled >= total {
                    let expected = get_u32_le(&self.buf, 12);
                    let mut crc = 0xFFFF_FFFFu32;
                    crc = crc32_update(crc, &self.buf[..12]);
                    crc = crc32_update(crc, &self.buf[HEADER_LEN..total]);
                    if crc ^ 0xFFFF_FFFF != expected {
                        return Err(ProtocolError::CrcMismatch);
                    }
                    let frame_type = FrameType::from_u8(raw_type)
                        .ok_or(ProtocolError::Malformed("frame type"))?;
                    // Payload stays parked at the front of the buffer until
                    // the next read_frame call consumes it.
                    return Ok((frame_type, HEADER_LEN..total));
                }
            }

            self.fill_more(transport, deadline)?;
        }
    }

    /// Borrow a payload range returned by [`read_frame`].
    pub fn payload(&self, range: std::ops::Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Drop the frame returned by the last [`read_frame`] call.
    pub fn consume_frame(&mut self, range: std::ops::Range<usize>) {
        self.consume(range.end);
    }

    fn consume(&mut self, n: usize) {
        self.buf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    fn fill_more(
        &mut self,
        transport: &mut dyn Transport,
        deadline_ns: u64,
    ) -> Result<(), ProtocolError> {
        let remaining_ns = deadline_ns.saturating_sub(clock::now_ns());
        if remaining_ns == 0 {
            return Err(ProtocolError::Transport(TransportError::Timeout));
        }
        if self.filled == self.buf.len() {
            // Full buffer with no parseable frame can only mean a frame
            // larger than the maximum slipped past the length check.
            return Err(ProtocolError::Malformed("oversized frame"));
        }
        let n = transport.recv(
            &mut self.buf[self.filled..],
            (remaining_ns / 1_000_000).max(1),
        )?;
        self.filled += n;
        Ok(())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
