//! Device-comm: the harness side of the adapter protocol.
//!
//! One adapter per kernel run. The harness either spawns the adapter binary
//! with a socketpair as its stdin/stdout (`local://`) or connects to a
//! pre-running adapter over tcp/serial/shm. The session is bounded by the
//! HELLO/CONFIG/ACK handshake and by [`DeviceComm::shutdown`], which closes
//! the stream, waits a bounded grace for the child to exit, and always
//! reaps it — a run never leaves a zombie behind.
//!
//! Exactly one window is outstanding at any time: `dispatch` is a strict
//! send-then-receive pair.

use crate::clock;
use crate::error::{ProtocolError, TransportError};
use crate::plugin::{Dtype, ABI_VERSION};
use crate::transport::{FdTransport, Side, Transport};
use crate::wire::chunk::{recv_result_chunks, send_window_chunks};
use crate::wire::{send_frame, Ack, Config, ErrorInfo, FrameReader, FrameType, Hello};
use anyhow::{bail, Context, Result};
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Session parameters fixed for one kernel run.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub fs: f32,
    pub window: u32,
    pub hop: u32,
    pub channels: u16,
    pub dtype: Dtype,
    pub plugin_id: String,
    pub params: String,
    /// Calibration state payload shipped in CONFIG (empty = none).
    pub calibration: Vec<u8>,
    pub hello_timeout_ms: u64,
    pub window_timeout_ms: u64,
    /// Grace added past the deadline before a RESULT receive times out.
    pub result_grace_ms: u64,
}

impl SessionParams {
    pub fn new(fs: f32, window: u32, hop: u32, channels: u16, plugin_id: &str) -> Self {
        Self {
            fs,
            window,
            hop,
            channels,
            dtype: Dtype::F32,
            plugin_id: plugin_id.to_string(),
            params: String::new(),
            calibration: Vec::new(),
            hello_timeout_ms: 5_000,
            window_timeout_ms: 10_000,
            result_grace_ms: 200,
        }
    }

    pub fn hop_period_ns(&self) -> u64 {
        (self.hop as f64 / self.fs as f64 * 1e9) as u64
    }

    fn input_bytes(&self) -> usize {
        self.window as usize * self.channels as usize * 4
    }
}

/// Harness- and device-clock stamps for one dispatched window.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowTiming {
    pub release_ns: u64,
    pub deadline_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub deadline_missed: bool,
    pub t_in: u64,
    pub t_start: u64,
    pub t_end: u64,
    pub t_first_tx: u64,
    pub t_last_tx: u64,
}

pub struct DeviceComm {
    transport: Box<dyn Transport>,
    reader: FrameReader,
    payload: Vec<u8>,
    frame: Vec<u8>,
    child: Option<Child>,
    params: SessionParams,
    pub hello: Hello,
    pub session_id: u64,
    pub out_window: u32,
    pub out_channels: u32,
    window_bytes: Vec<u8>,
    result_bytes: Vec<u8>,
    result_cap: u32,
}

impl DeviceComm {
    /// Spawn the adapter binary with one end of a socketpair as its
    /// stdin/stdout, then handshake.
    pub fn spawn(adapter_bin: &Path, extra_args: &[String], params: SessionParams) -> Result<Self> {
        let (parent_fd, child_fd) = crate::transport::fd_socketpair().context("socketpair")?;
        // The child needs the FD twice (stdin and stdout); Stdio takes
        // ownership, so hand it a dup.
        let child_fd_out = unsafe { libc::dup(child_fd) };
        if child_fd_out < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(parent_fd);
                libc::close(child_fd);
            }
            bail!("dup child fd: {err}");
        }
        let child = Command::new(adapter_bin)
            .args(extra_args)
            .arg("--transport")
            .arg("local://")
            .stdin(unsafe { Stdio::from_raw_fd(child_fd) })
            .stdout(unsafe { Stdio::from_raw_fd(child_fd_out) })
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn adapter {}", adapter_bin.display()));
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                unsafe { libc::close(parent_fd) };
                return Err(e);
            }
        };
        info!(pid = child.id(), adapter = %adapter_bin.display(), "adapter spawned");
        let transport = Box::new(FdTransport::from_owned(parent_fd, parent_fd));
        Self::handshake(transport, Some(child), params)
    }

    /// Connect to a pre-running adapter over a transport URI, then handshake.
    pub fn connect(uri: &str, params: SessionParams) -> Result<Self> {
        let transport = crate::transport::open(uri, Side::Harness)?;
        Self::handshake(transport, None, params)
    }

    /// Handshake over an already-open transport. Used when the peer is an
    /// in-process adapter (latency baselines, tests) rather than a child.
    pub fn over_transport(transport: Box<dyn Transport>, params: SessionParams) -> Result<Self> {
        Self::handshake(transport, None, params)
    }

    fn handshake(
        mut transport: Box<dyn Transport>,
        child: Option<Child>,
        params: SessionParams,
    ) -> Result<Self> {
        let mut reader = FrameReader::new();
        let mut payload = Vec::new();
        let mut frame = Vec::new();

        // HELLO
        let hello = match Self::recv_hello(&mut *transport, &mut reader, params.hello_timeout_ms) {
            Ok(h) => h,
            Err(e) => {
                reap(child, 1_000);
                return Err(e);
            }
        };
        if hello.abi_version != ABI_VERSION {
            reap(child, 1_000);
            bail!(
                "adapter {:?} speaks ABI {}, harness speaks {}",
                hello.adapter_name,
                hello.abi_version,
                ABI_VERSION
            );
        }
        if params.window > hello.max_window_samples || params.channels > hello.max_channels {
            reap(child, 1_000);
            bail!(
                "shape {}x{} exceeds adapter limits {}x{}",
                params.window,
                params.channels,
                hello.max_window_samples,
                hello.max_channels
            );
        }
        // Dynamic-library plugins are not advertised; only warn for names
        // the adapter's registry should know.
        if !params.plugin_id.ends_with(".so") && !params.plugin_id.ends_with(".dylib") {
            let name = params
                .plugin_id
                .rsplit('/')
                .next()
                .unwrap_or(&params.plugin_id)
                .split('@')
                .next()
                .unwrap_or("");
            if !hello.kernels.iter().any(|k| k == name) {
                warn!(
                    plugin = %params.plugin_id,
                    advertised = ?hello.kernels,
                    "plugin not in adapter's advertised kernel list"
                );
            }
        }
        debug!(
            adapter = %hello.adapter_name,
            boot_id = format_args!("{:#018x}", hello.boot_id),
            kernels = ?hello.kernels,
            "HELLO received"
        );

        // CONFIG
        let session_id: u64 = rand::random();
        let config = Config {
            session_id,
            fs: params.fs,
            window: params.window,
            hop: params.hop,
            channels: params.channels,
            dtype: params.dtype.tag(),
            flags: 0,
            plugin_id: params.plugin_id.clone(),
            params: params.params.clone(),
            calibration: params.calibration.clone(),
        };
        config.encode(&mut payload);
        if let Err(e) = send_frame(&mut *transport, &mut frame, FrameType::Config, &payload) {
            reap(child, 1_000);
            return Err(e).context("send CONFIG");
        }

        // ACK
        let ack = match Self::recv_ack(&mut *transport, &mut reader, params.hello_timeout_ms) {
            Ok(a) => a,
            Err(e) => {
                reap(child, 1_000);
                return Err(e);
            }
        };
        if ack.out_window == 0 || ack.out_channels == 0 {
            reap(child, 1_000);
            bail!("adapter ACKed an empty output shape");
        }
        info!(
            session_id = format_args!("{session_id:#018x}"),
            out_window = ack.out_window,
            out_channels = ack.out_channels,
            "session established"
        );

        // Result buffer sized once from the ACKed shape.
        let result_cap = ack.out_window * ack.out_channels * 4;
        let input_bytes = params.input_bytes();
        Ok(Self {
            transport,
            reader,
            payload,
            frame,
            child,
            hello,
            session_id,
            out_window: ack.out_window,
            out_channels: ack.out_channels,
            window_bytes: vec![0u8; input_bytes],
            result_bytes: Vec::with_capacity(result_cap as usize),
            result_cap,
            params,
        })
    }

    fn recv_hello(
        transport: &mut dyn Transport,
        reader: &mut FrameReader,
        timeout_ms: u64,
    ) -> Result<Hello> {
        let (ftype, range) = reader
            .read_frame(transport, timeout_ms)
            .context("waiting for HELLO")?;
        let hello = match ftype {
            FrameType::Hello => Hello::decode(reader.payload(range.clone()))?,
            FrameType::Error => {
                let e = ErrorInfo::decode(reader.payload(range.clone()))?;
                bail!("adapter error before HELLO: {} ({})", e.message, e.code);
            }
            other => bail!("expected HELLO, got {other:?}"),
        };
        reader.consume_frame(range);
        Ok(hello)
    }

    fn recv_ack(
        transport: &mut dyn Transport,
        reader: &mut FrameReader,
        timeout_ms: u64,
    ) -> Result<Ack> {
        let (ftype, range) = reader
            .read_frame(transport, timeout_ms)
            .context("waiting for ACK")?;
        let ack = match ftype {
            FrameType::Ack => Ack::decode(reader.payload(range.clone()))?,
            FrameType::Error => {
                let e = ErrorInfo::decode(reader.payload(range.clone()))?;
                bail!("adapter rejected CONFIG: {} ({})", e.message, e.code);
            }
            other => bail!("expected ACK, got {other:?}"),
        };
        reader.consume_frame(range);
        Ok(ack)
    }

    pub fn adapter_name(&self) -> &str {
        &self.hello.adapter_name
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Samples per result window, as ACKed by the adapter.
    pub fn output_len(&self) -> usize {
        self.out_window as usize * self.out_channels as usize
    }

    /// Send one window and receive its result.
    ///
    /// Timestamps: `release` on entry, `deadline = release + H/Fs`, `start`
    /// after the last chunk is handed to the transport, `end` once the
    /// result is reassembled and validated. The receive timeout is the time
    /// left to the deadline plus a small grace, never more than the outer
    /// window timeout.
    pub fn dispatch(
        &mut self,
        window_index: u64,
        input: &[f32],
        output: &mut Vec<f32>,
    ) -> Result<WindowTiming, ProtocolError> {
        debug_assert_eq!(input.len() * 4, self.window_bytes.len());
        let release_ns = clock::now_ns();
        let deadline_ns = release_ns + self.params.hop_period_ns();

        crate::bytes::f32_to_le_bytes(input, &mut self.window_bytes);
        send_window_chunks(
            &mut *self.transport,
            &mut self.payload,
            &mut self.frame,
            window_index,
            &self.window_bytes,
        )?;
        let start_ns = clock::now_ns();

        let to_deadline_ms = deadline_ns.saturating_sub(start_ns) / 1_000_000;
        let timeout_ms = (to_deadline_ms + self.params.result_grace_ms)
            .min(self.params.window_timeout_ms);
        let result = recv_result_chunks(
            &mut *self.transport,
            &mut self.reader,
            window_index,
            self.result_cap,
            &mut self.result_bytes,
            timeout_ms,
        )?;
        let end_ns = clock::now_ns();

        if result.session_id != self.session_id {
            return Err(ProtocolError::SessionMismatch {
                expected: self.session_id,
                got: result.session_id,
            });
        }
        if result.out_window != self.out_window || result.out_channels != self.out_channels {
            return Err(ProtocolError::Malformed("result shape changed mid-session"));
        }
        if self.result_bytes.len() != self.output_len() * 4 {
            return Err(ProtocolError::Malformed("result byte count"));
        }
        output.resize(self.output_len(), 0.0);
        crate::bytes::f32_from_le_bytes(&self.result_bytes, output);

        Ok(WindowTiming {
            release_ns,
            deadline_ns,
            start_ns,
            end_ns,
            deadline_missed: end_ns > deadline_ns,
            t_in: result.t_in,
            t_start: result.t_start,
            t_end: result.t_end,
            t_first_tx: result.t_first_tx,
            t_last_tx: result.t_last_tx,
        })
    }

    /// Orderly teardown: close the stream so the adapter sees end-of-file,
    /// wait up to `grace_ms` for it to exit, then force-terminate. The
    /// child is reaped on every path.
    pub fn shutdown(mut self, grace_ms: u64) {
        self.transport.close();
        reap(self.child.take(), grace_ms);
    }
}

impl Drop for DeviceComm {
    fn drop(&mut self) {
        // Normal exits go through `shutdown`; this is the abort path.
        self.transport.close();
        reap(self.child.take(), 1_000);
    }
}

/// Wait up to `grace_ms` for the child to exit, then SIGKILL and reap.
fn reap(child: Option<Child>, grace_ms: u64) {
    let Some(mut child) = child else { return };
    let deadline = clock::now_ns() + grace_ms.saturating_mul(1_000_000);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "adapter exited");
                return;
            }
            Ok(None) => {
                if clock::now_ns() >= deadline {
                    warn!(pid = child.id(), "adapter did not exit in time, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => {
                warn!(pid = child.id(), "wait on adapter failed: {e}");
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }
    }
}
