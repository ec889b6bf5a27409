//! Chunked window/result transfer.
//!
//! Transfers larger than one chunk are split into frames of at most
//! [`MAX_CHUNK_DATA`] data bytes. The sender fills left to right and sets
//! LAST on the final chunk; the receiver requires offset 0 first, contiguous
//! advancement, and an exact landing on `total_bytes`. Chunks are never
//! reordered by a compliant transport — any gap or repeat is a protocol
//! error, not something to buffer around.

use crate::clock;
use crate::error::ProtocolError;
use crate::transport::Transport;
use crate::wire::payload::{ChunkHeader, ErrorInfo, ResultHeader, CHUNK_FLAG_LAST};
use crate::wire::{send_frame, FrameReader, FrameType, MAX_CHUNK_DATA};

/// Iterate `(offset, len, is_last)` chunk spans over `total` bytes.
/// A zero-byte transfer still yields one empty LAST chunk.
fn chunk_spans(total: usize) -> impl Iterator<Item = (usize, usize, bool)> {
    let count = (total / MAX_CHUNK_DATA).max(1) + usize::from(total % MAX_CHUNK_DATA != 0 && total > MAX_CHUNK_DATA);
    (0..count).map(move |i| {
        let offset = i * MAX_CHUNK_DATA;
        let len = (total - offset).min(MAX_CHUNK_DATA);
        (offset, len, i == count - 1)
    })
}

/// Send one window as a sequence of WINDOW_CHUNK frames.
pub fn send_window_chunks(
    transport: &mut dyn Transport,
    payload_scratch: &mut Vec<u8>,
    frame_scratch: &mut Vec<u8>,
    sequence: u64,
    data: &[u8],
) -> Result<(), ProtocolError> {
    for (offset, len, last) in chunk_spans(data.len()) {
        let hdr = ChunkHeader {
            sequence,
            total_bytes: data.len() as u32,
            offset_bytes: offset as u32,
            chunk_len: len as u32,
            flags: if last { CHUNK_FLAG_LAST } else { 0 },
        };
        payload_scratch.clear();
        hdr.encode_into(payload_scratch);
        payload_scratch.extend_from_slice(&data[offset..offset + len]);
        send_frame(transport, frame_scratch, FrameType::WindowChunk, payload_scratch)?;
    }
    Ok(())
}

/// Send one result, chunked under the same rules. The fixed result header
/// is repeated on every chunk frame so each is independently checkable.
///
/// `result.t_last_tx` is stamped here, immediately before the final chunk's
/// send — the stamp has to ride in the frame it describes, so the
/// post-return instant itself cannot be carried.
pub fn send_result_chunks(
    transport: &mut dyn Transport,
    payload_scratch: &mut Vec<u8>,
    frame_scratch: &mut Vec<u8>,
    result: &mut ResultHeader,
    data: &[u8],
) -> Result<(), ProtocolError> {
    for (offset, len, last) in chunk_spans(data.len()) {
        if last {
            result.t_last_tx = transport.monotonic_ns();
        }
        let hdr = ChunkHeader {
            sequence: result.sequence,
            total_bytes: data.len() as u32,
            offset_bytes: offset as u32,
            chunk_len: len as u32,
            flags: if last { CHUNK_FLAG_LAST } else { 0 },
        };
        payload_scratch.clear();
        result.encode_into(payload_scratch);
        hdr.encode_into(payload_scratch);
        payload_scratch.extend_from_slice(&data[offset..offset + len]);
        send_frame(transport, frame_scratch, FrameType::Result, payload_scratch)?;
    }
    Ok(())
}

/// Validates and accumulates one chunked transfer.
pub struct Reassembler {
    expected_seq: u64,
    capacity: u32,
    total: Option<u32>,
    received: u32,
}

impl Reassembler {
    pub fn new(expected_seq: u64, capacity: u32) -> Self {
        Self {
            expected_seq,
            capacity,
            total: None,
            received: 0,
        }
    }

    /// Feed one chunk; `dst` is sized to `total_bytes` on the first chunk.
    /// Returns true once the transfer is complete.
    pub fn accept(
        &mut self,
        hdr: &ChunkHeader,
        data: &[u8],
        dst: &mut Vec<u8>,
    ) -> Result<bool, ProtocolError> {
        if hdr.sequence != self.expected_seq {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.expected_seq,
                got: hdr.sequence,
            });
        }
        match self.total {
            None => {
                if hdr.offset_bytes != 0 {
                    return Err(ProtocolError::SequenceMismatch {
                        expected: 0,
                        got: hdr.offset_bytes as u64,
                    });
                }
                if hdr.total_bytes > self.capacity {
                    return Err(ProtocolError::BufferTooSmall {
                        needed: hdr.total_bytes,
                        capacity: self.capacity,
                    });
                }
                self.total = Some(hdr.total_bytes);
                dst.clear();
                dst.resize(hdr.total_bytes as usize, 0);
            }
            Some(total) => {
                if hdr.total_bytes != total {
                    return Err(ProtocolError::Malformed("chunk total changed"));
                }
                if hdr.offset_bytes != self.received {
                    return Err(ProtocolError::SequenceMismatch {
                        expected: self.received as u64,
                        got: hdr.offset_bytes as u64,
                    });
                }
            }
        }
        let total = self.total.unwrap();
        if hdr.chunk_len == 0 && !hdr.is_last() {
            return Err(ProtocolError::Malformed("empty non-final chunk"));
        }
        if hdr.offset_bytes + hdr.chunk_len > total {
            return Err(ProtocolError::Malformed("chunk overruns total"));
        }
        let start = hdr.offset_bytes as usize;
        dst[start..start + data.len()].copy_from_slice(data);
        self.received += hdr.chunk_len;
        if hdr.is_last() {
            if self.received != total {
                return Err(ProtocolError::Incomplete {
                    received: self.received,
                    total,
                });
            }
            return Ok(true);
        }
        Ok(false)
    }
}

/// Receive one complete window into `dst` (raw little-endian bytes).
/// One deadline covers every frame of the transfer.
pub fn recv_window_chunks(
    transport: &mut dyn Transport,
    reader: &mut FrameReader,
    expected_seq: u64,
    capacity: u32,
    dst: &mut Vec<u8>,
    timeout_ms: u64,
) -> Result<(), ProtocolError> {
    let deadline = clock::now_ns() + timeout_ms.saturating_mul(1_000_000);
    let mut asm = Reassembler::new(expected_seq, capacity);
    loop {
        let remaining_ms = remaining_ms(deadline);
        let (ftype, range) = reader.read_frame(transport, remaining_ms)?;
        let done = match ftype {
            FrameType::WindowChunk => {
                let (hdr, data) = ChunkHeader::decode_prefix(reader.payload(range.clone()))?;
                asm.accept(&hdr, data, dst)?
            }
            FrameType::Error => {
                let info = ErrorInfo::decode(reader.payload(range.clone()))?;
                return Err(ProtocolError::Remote {
                    code: info.code,
                    message: info.message,
                });
            }
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    got: other,
                    expected: "WINDOW_CHUNK",
                })
            }
        };
        reader.consume_frame(range);
        if done {
            return Ok(());
        }
    }
}

/// Receive one complete result into `dst`, returning the (consistent)
/// result header. Session validation is the caller's concern.
pub fn recv_result_chunks(
    transport: &mut dyn Transport,
    reader: &mut FrameReader,
    expected_seq: u64,
    capacity: u32,
    dst: &mut Vec<u8>,
    timeout_ms: u64,
) -> Result<ResultHeader, ProtocolError> {
    let deadline = clock::now_ns() + timeout_ms.saturating_mul(1_000_000);
    let mut asm = Reassembler::new(expected_seq, capacity);
    let mut first: Option<ResultHeader> = None;
    loop {
        let remaining_ms = remaining_ms(deadline);
        let (ftype, range) = reader.read_frame(transport, remaining_ms)?;
        let mut done = false;
        match ftype {
            FrameType::Result => {
                let (rh, rest) = ResultHeader::decode_prefix(reader.payload(range.clone()))?;
                let (ch, data) = ChunkHeader::decode_prefix(rest)?;
                if let Some(prev) = &first {
                    if prev.session_id != rh.session_id || prev.sequence != rh.sequence {
                        return Err(ProtocolError::Malformed("result header changed"));
                    }
                }
                // Keep the newest copy: the final chunk carries the real
                // t_last_tx stamp.
                first = Some(rh);
                done = asm.accept(&ch, data, dst)?;
            }
            FrameType::Error => {
                let info = ErrorInfo::decode(reader.payload(range.clone()))?;
                return Err(ProtocolError::Remote {
                    code: info.code,
                    message: info.message,
                });
            }
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    got: other,
                    expected: "RESULT",
                })
            }
        }
        reader.consume_frame(range);
        if done {
            return Ok(first.expect("header recorded with first chunk"));
        }
    }
}

fn remaining_ms(deadline_ns: u64) -> u64 {
    deadline_ns.saturating_sub(clock::now_ns()) / 1_000_000
}
