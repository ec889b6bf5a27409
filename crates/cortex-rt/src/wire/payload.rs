//! Typed frame payloads and their packed little-endian codecs.
//!
//! Strings travel length-prefixed (u8 or u16 as noted); every multi-byte
//! field goes through the byte helpers so decode works on unaligned
//! buffers. Each `decode` validates lengths and returns `Malformed` rather
//! than panicking on short input.

use crate::bytes::{get_f32_le, get_u16_le, get_u32_le, get_u64_le, put_f32_le, put_u16_le, put_u32_le, put_u64_le};
use crate::error::ProtocolError;

/// Max length of the adapter identifier in HELLO.
pub const MAX_ADAPTER_NAME: usize = 32;
/// Max length of an ERROR frame message.
pub const MAX_ERROR_MESSAGE: usize = 256;

/// Chunk flag: this is the final chunk of the transfer.
pub const CHUNK_FLAG_LAST: u16 = 1;

// ---------------------------------------------------------------------------
// Cursor helpers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Malformed(self.what));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        let v = get_u16_le(self.buf, self.pos);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        let v = get_u32_le(self.buf, self.pos);
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        let v = get_u64_le(self.buf, self.pos);
        self.pos += 8;
        Ok(v)
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        self.need(4)?;
        let v = get_f32_le(self.buf, self.pos);
        self.pos += 4;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// u8-length-prefixed UTF-8 string (lossy on invalid bytes).
    fn str8(&mut self) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    /// u16-length-prefixed UTF-8 string.
    fn str16(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    fn done(self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::Malformed(self.what));
        }
        Ok(())
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    let at = out.len();
    out.resize(at + 2, 0);
    put_u16_le(out, at, v);
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    let at = out.len();
    out.resize(at + 4, 0);
    put_u32_le(out, at, v);
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    let at = out.len();
    out.resize(at + 8, 0);
    put_u64_le(out, at, v);
}

fn push_f32(out: &mut Vec<u8>, v: f32) {
    let at = out.len();
    out.resize(at + 4, 0);
    put_f32_le(out, at, v);
}

fn push_str8(out: &mut Vec<u8>, s: &str, cap: usize) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(cap).min(u8::MAX as usize);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

fn push_str16(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    push_u16(out, len as u16);
    out.extend_from_slice(&bytes[..len]);
}

// ---------------------------------------------------------------------------
// HELLO (adapter → harness)
// ---------------------------------------------------------------------------

/// Adapter self-description sent once after boot.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    /// Random per process launch; a changed boot id marks an adapter restart.
    pub boot_id: u64,
    pub adapter_name: String,
    pub abi_version: u32,
    pub max_window_samples: u32,
    pub max_channels: u16,
    /// Device metadata; empty strings when the adapter has nothing to say.
    pub hostname: String,
    pub cpu: String,
    pub os: String,
    /// Kernels the adapter can host.
    pub kernels: Vec<String>,
}

impl Hello {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        push_u64(out, self.boot_id);
        push_u32(out, self.abi_version);
        push_u32(out, self.max_window_samples);
        push_u16(out, self.max_channels);
        push_u16(out, self.kernels.len().min(u16::MAX as usize) as u16);
        push_str8(out, &self.adapter_name, MAX_ADAPTER_NAME);
        push_str8(out, &self.hostname, u8::MAX as usize);
        push_str8(out, &self.cpu, u8::MAX as usize);
        push_str8(out, &self.os, u8::MAX as usize);
        for name in &self.kernels {
            push_str8(out, name, u8::MAX as usize);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf, "HELLO");
        let boot_id = r.u64()?;
        let abi_version = r.u32()?;
        let max_window_samples = r.u32()?;
        let max_channels = r.u16()?;
        let kernel_count = r.u16()?;
        let adapter_name = r.str8()?;
        let hostname = r.str8()?;
        let cpu = r.str8()?;
        let os = r.str8()?;
        let mut kernels = Vec::with_capacity(kernel_count as usize);
        for _ in 0..kernel_count {
            kernels.push(r.str8()?);
        }
        r.done()?;
        Ok(Self {
            boot_id,
            adapter_name,
            abi_version,
            max_window_samples,
            max_channels,
            hostname,
            cpu,
            os,
            kernels,
        })
    }
}

// ---------------------------------------------------------------------------
// CONFIG (harness → adapter)
// ---------------------------------------------------------------------------

/// Run configuration for one kernel session.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Random per run; every RESULT must echo it.
    pub session_id: u64,
    pub fs: f32,
    pub window: u32,
    pub hop: u32,
    pub channels: u16,
    /// Numeric dtype tag; 1 = f32.
    pub dtype: u8,
    /// Bit 0: kernel may process in place.
    pub flags: u8,
    /// Plugin identifier, e.g. `primitives/kernels/v1/noop@f32`.
    pub plugin_id: String,
    /// Opaque plugin-parameter string, passed through to `init`.
    pub params: String,
    /// Calibration state payload, if the kernel is trainable.
    pub calibration: Vec<u8>,
}

impl Config {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        push_u64(out, self.session_id);
        push_f32(out, self.fs);
        push_u32(out, self.window);
        push_u32(out, self.hop);
        push_u16(out, self.channels);
        out.push(self.dtype);
        out.push(self.flags);
        push_str16(out, &self.plugin_id);
        push_str16(out, &self.params);
        push_u32(out, self.calibration.len() as u32);
        out.extend_from_slice(&self.calibration);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf, "CONFIG");
        let session_id = r.u64()?;
        let fs = r.f32()?;
        let window = r.u32()?;
        let hop = r.u32()?;
        let channels = r.u16()?;
        let dtype = r.u8()?;
        let flags = r.u8()?;
        let plugin_id = r.str16()?;
        let params = r.str16()?;
        let calib_len = r.u32()? as usize;
        let calibration = r.bytes(calib_len)?.to_vec();
        r.done()?;
        Ok(Self {
            session_id,
            fs,
            window,
            hop,
            channels,
            dtype,
            flags,
            plugin_id,
            params,
            calibration,
        })
    }
}

// ---------------------------------------------------------------------------
// ACK (adapter → harness)
// ---------------------------------------------------------------------------

/// Kernel initialized; reports the actual output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub out_window: u32,
    pub out_channels: u32,
}

impl Ack {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        push_u32(out, self.out_window);
        push_u32(out, self.out_channels);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf, "ACK");
        let out_window = r.u32()?;
        let out_channels = r.u32()?;
        r.done()?;
        Ok(Self {
            out_window,
            out_channels,
        })
    }
}

// ---------------------------------------------------------------------------
// Chunk header (shared by WINDOW_CHUNK and chunked RESULT)
// ---------------------------------------------------------------------------

/// Per-chunk metadata. A transfer starts at offset 0, advances contiguously,
/// and terminates with [`CHUNK_FLAG_LAST`]; the union of chunk ranges must
/// equal exactly `total_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Window index this transfer belongs to.
    pub sequence: u64,
    /// Byte length of the entire transfer.
    pub total_bytes: u32,
    pub offset_bytes: u32,
    pub chunk_len: u32,
    pub flags: u16,
}

impl ChunkHeader {
    pub const LEN: usize = 22;

    pub fn is_last(&self) -> bool {
        self.flags & CHUNK_FLAG_LAST != 0
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        push_u64(out, self.sequence);
        push_u32(out, self.total_bytes);
        push_u32(out, self.offset_bytes);
        push_u32(out, self.chunk_len);
        push_u16(out, self.flags);
    }

    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let mut r = Reader::new(buf, "chunk header");
        let sequence = r.u64()?;
        let total_bytes = r.u32()?;
        let offset_bytes = r.u32()?;
        let chunk_len = r.u32()?;
        let flags = r.u16()?;
        let data = r.bytes(chunk_len as usize)?;
        r.done()?;
        Ok((
            Self {
                sequence,
                total_bytes,
                offset_bytes,
                chunk_len,
                flags,
            },
            data,
        ))
    }
}

// ---------------------------------------------------------------------------
// RESULT (adapter → harness)
// ---------------------------------------------------------------------------

/// Fixed prefix of every RESULT frame. Large outputs are chunked under the
/// same rules as windows; the prefix is repeated on every chunk so each
/// frame is independently attributable to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultHeader {
    pub session_id: u64,
    pub sequence: u64,
    /// Device stamps, nanoseconds on the adapter's clock:
    /// input fully reassembled / process begin / process end /
    /// first result byte handed to transport / last send returned.
    pub t_in: u64,
    pub t_start: u64,
    pub t_end: u64,
    pub t_first_tx: u64,
    pub t_last_tx: u64,
    pub out_window: u32,
    pub out_channels: u32,
}

impl ResultHeader {
    pub const LEN: usize = 64;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        push_u64(out, self.session_id);
        push_u64(out, self.sequence);
        push_u64(out, self.t_in);
        push_u64(out, self.t_start);
        push_u64(out, self.t_end);
        push_u64(out, self.t_first_tx);
        push_u64(out, self.t_last_tx);
        push_u32(out, self.out_window);
        push_u32(out, self.out_channels);
    }

    /// Split a RESULT payload into its fixed header and the trailing
    /// chunk-header-plus-data region.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if buf.len() < Self::LEN {
            return Err(ProtocolError::Malformed("RESULT"));
        }
        let hdr = Self {
            session_id: get_u64_le(buf, 0),
            sequence: get_u64_le(buf, 8),
            t_in: get_u64_le(buf, 16),
            t_start: get_u64_le(buf, 24),
            t_end: get_u64_le(buf, 32),
            t_first_tx: get_u64_le(buf, 40),
            t_last_tx: get_u64_le(buf, 48),
            out_window: get_u32_le(buf, 56),
            out_channels: get_u32_le(buf, 60),
        };
        Ok((hdr, &buf[Self::LEN..]))
    }
}

// ---------------------------------------------------------------------------
// ERROR (either direction)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        push_u32(out, self.code);
        let msg = if self.message.len() > MAX_ERROR_MESSAGE {
            &self.message[..MAX_ERROR_MESSAGE]
        } else {
            &self.message
        };
        push_str16(out, msg);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf, "ERROR");
        let code = r.u32()?;
        let message = r.str16()?;
        r.done()?;
        Ok(Self { code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello {
            boot_id: 0xDEAD_BEEF_1234_5678,
            adapter_name: "posix-dyn".into(),
            abi_version: 1,
            max_window_samples: 4096,
            max_channels: 256,
            hostname: "bench-01".into(),
            cpu: "cortex-a72".into(),
            os: "linux".into(),
            kernels: vec!["noop".into(), "car".into(), "baseline".into()],
        };
        let mut buf = Vec::new();
        hello.encode(&mut buf);
        assert_eq!(Hello::decode(&buf).unwrap(), hello);
    }

    #[test]
    fn test_hello_name_truncated_to_limit() {
        let hello = Hello {
            boot_id: 1,
            adapter_name: "x".repeat(100),
            abi_version: 1,
            max_window_samples: 1,
            max_channels: 1,
            hostname: String::new(),
            cpu: String::new(),
            os: String::new(),
            kernels: vec![],
        };
        let mut buf = Vec::new();
        hello.encode(&mut buf);
        let back = Hello::decode(&buf).unwrap();
        assert_eq!(back.adapter_name.len(), MAX_ADAPTER_NAME);
    }

    #[test]
    fn test_config_roundtrip_with_calibration() {
        let config = Config {
            session_id: 42,
            fs: 160.0,
            window: 160,
            hop: 80,
            channels: 64,
            dtype: 1,
            flags: 0,
            plugin_id: "primitives/kernels/v1/baseline@f32".into(),
            params: "order=4".into(),
            calibration: (0..=255u8).collect(),
        };
        let mut buf = Vec::new();
        config.encode(&mut buf);
        assert_eq!(Config::decode(&buf).unwrap(), config);
    }

    #[test]
    fn test_truncated_payloads_are_malformed() {
        let config = Config {
            session_id: 1,
            fs: 250.0,
            window: 500,
            hop: 125,
            channels: 8,
            dtype: 1,
            flags: 0,
            plugin_id: "k".into(),
            params: String::new(),
            calibration: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        config.encode(&mut buf);
        for cut in [0, 1, 8, buf.len() - 1] {
            assert!(Config::decode(&buf[..cut]).is_err(), "cut at {cut}");
        }
        // Trailing junk is rejected too.
        buf.push(0);
        assert!(Config::decode(&buf).is_err());
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let hdr = ChunkHeader {
            sequence: 7,
            total_bytes: 40_960,
            offset_bytes: 8_192,
            chunk_len: 4,
            flags: CHUNK_FLAG_LAST,
        };
        let mut buf = Vec::new();
        hdr.encode_into(&mut buf);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let (back, data) = ChunkHeader::decode_prefix(&buf).unwrap();
        assert_eq!(back, hdr);
        assert!(back.is_last());
        assert_eq!(data, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_result_header_roundtrip() {
        let hdr = ResultHeader {
            session_id: 99,
            sequence: 3,
            t_in: 10,
            t_start: 20,
            t_end: 30,
            t_first_tx: 40,
            t_last_tx: 50,
            out_window: 160,
            out_channels: 64,
        };
        let mut buf = Vec::new();
        hdr.encode_into(&mut buf);
        assert_eq!(buf.len(), ResultHeader::LEN);
        buf.extend_from_slice(b"rest");
        let (back, rest) = ResultHeader::decode_prefix(&buf).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn test_error_info_message_capped() {
        let info = ErrorInfo::new(7, "e".repeat(1000));
        let mut buf = Vec::new();
        info.encode(&mut buf);
        let back = ErrorInfo::decode(&buf).unwrap();
        assert_eq!(back.code, 7);
        assert_eq!(back.message.len(), MAX_ERROR_MESSAGE);
    }
}
