//! Adapter runtime: the process that hosts a kernel.
//!
//! Lifecycle: emit HELLO, receive CONFIG, resolve and init the kernel, send
//! ACK with the actual output shape, then run the window loop until the
//! harness stops sending. Per window the adapter stamps, on its own clock:
//! `t_in` after the last chunk is reassembled into the host-format float
//! buffer (input ready, not first byte seen), `t_start`/`t_end` around
//! `process`, and `t_first_tx`/`t_last_tx` around the RESULT send.
//!
//! Fatal conditions are reported with an ERROR frame before exit where the
//! transport still works; a plain transport closure is also a valid way to
//! die. Input and output buffers are allocated once after CONFIG and reused
//! for every window.

use crate::bytes::{f32_from_le_bytes, f32_to_le_bytes};
use crate::error::{KernelError, ProtocolError, TransportError};
use crate::plugin::{Dtype, KernelConfig, Registry, ABI_VERSION};
use crate::transport::Transport;
use crate::wire::chunk::{recv_window_chunks, send_result_chunks};
use crate::wire::{error_code, send_frame, Ack, Config, ErrorInfo, FrameReader, FrameType, Hello, ResultHeader};
use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

/// Largest calibration payload accepted in CONFIG. Bounded well under the
/// single-frame maximum so the CONFIG frame's fixed fields always fit.
pub const MAX_CALIBRATION_BYTES: usize = 48 * 1024;

pub struct AdapterOptions {
    /// Identifier reported in HELLO (≤32 bytes on the wire).
    pub name: String,
    /// Wait for CONFIG after HELLO.
    pub config_timeout_ms: u64,
    /// Outer timeout for one full window transfer. Expiry is the normal
    /// end-of-run signal when the harness has gone away silently.
    pub window_timeout_ms: u64,
    pub max_window_samples: u32,
    pub max_channels: u16,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            name: "posix".into(),
            config_timeout_ms: 10_000,
            window_timeout_ms: 10_000,
            max_window_samples: 65_536,
            max_channels: 1_024,
        }
    }
}

/// Run the adapter loop to completion. `Ok` covers every orderly ending:
/// peer close, end-of-stream, or idle timeout after the last window.
pub fn run(
    mut transport: Box<dyn Transport>,
    registry: &Registry,
    opts: &AdapterOptions,
) -> Result<()> {
    let boot_id: u64 = rand::random();
    let mut reader = FrameReader::new();
    let mut payload = Vec::new();
    let mut frame = Vec::new();

    // HELLO
    let hello = Hello {
        boot_id,
        adapter_name: opts.name.clone(),
        abi_version: ABI_VERSION,
        max_window_samples: opts.max_window_samples,
        max_channels: opts.max_channels,
        hostname: hostname(),
        cpu: cpu_model(),
        os: std::env::consts::OS.to_string(),
        kernels: registry.names(),
    };
    hello.encode(&mut payload);
    send_frame(&mut *transport, &mut frame, FrameType::Hello, &payload)
        .context("send HELLO")?;
    info!(boot_id = format_args!("{boot_id:#018x}"), "adapter up, waiting for CONFIG");

    // CONFIG
    let config = recv_config(&mut *transport, &mut reader, opts.config_timeout_ms)?;
    let session_id = config.session_id;
    debug!(
        session_id = format_args!("{session_id:#018x}"),
        plugin = %config.plugin_id,
        fs = config.fs,
        window = config.window,
        hop = config.hop,
        channels = config.channels,
        "CONFIG received"
    );

    if let Err(e) = validate_config(&config, opts) {
        let info = ErrorInfo::new(e.0, e.1.clone());
        info.encode(&mut payload);
        let _ = send_frame(&mut *transport, &mut frame, FrameType::Error, &payload);
        transport.close();
        bail!("CONFIG rejected: {}", e.1);
    }

    // Kernel resolve + init
    let dtype = Dtype::from_tag(config.dtype).expect("validated above");
    let kernel_cfg = KernelConfig {
        abi_version: ABI_VERSION,
        fs: config.fs,
        window: config.window,
        hop: config.hop,
        channels: config.channels as u32,
        dtype,
        in_place: config.flags & 1 != 0,
        params: &config.params,
        calibration: if config.calibration.is_empty() {
            None
        } else {
            Some(&config.calibration)
        },
    };
    let mut instance = match registry.load(&config.plugin_id, &kernel_cfg) {
        Ok(instance) => instance,
        Err(err) => {
            let code = match &err {
                KernelError::UnknownKernel(_) => error_code::UNKNOWN_KERNEL,
                _ => error_code::KERNEL_INIT_FAILED,
            };
            let info = ErrorInfo::new(code, err.to_string());
            info.encode(&mut payload);
            let _ = send_frame(&mut *transport, &mut frame, FrameType::Error, &payload);
            transport.close();
            return Err(anyhow!(err).context("kernel init"));
        }
    };
    info!(
        plugin = %config.plugin_id,
        out_window = instance.out_window,
        out_channels = instance.out_channels,
        capabilities = instance.capabilities,
        "kernel initialized"
    );

    // ACK with the actual output shape.
    let ack = Ack {
        out_window: instance.out_window,
        out_channels: instance.out_channels,
    };
    ack.encode(&mut payload);
    send_frame(&mut *transport, &mut frame, FrameType::Ack, &payload).context("send ACK")?;

    // Buffers sized once, reused every window.
    let in_len = config.window as usize * config.channels as usize;
    let in_bytes_cap = (in_len * 4) as u32;
    let mut in_bytes: Vec<u8> = Vec::with_capacity(in_len * 4);
    let mut input = vec![0f32; in_len];
    let out_len = instance.output_len();
    let mut output = vec![0f32; out_len];
    let mut out_bytes = vec![0u8; out_len * 4];

    // Window loop. Sequence starts at 0 and increments monotonically.
    let mut sequence = 0u64;
    let exit = loop {
        match recv_window_chunks(
            &mut *transport,
            &mut reader,
            sequence,
            in_bytes_cap,
            &mut in_bytes,
            opts.window_timeout_ms,
        ) {
            Ok(()) => {}
            Err(ProtocolError::Transport(TransportError::Timeout)) => {
                info!(windows = sequence, "idle timeout, shutting down");
                break Ok(());
            }
            Err(ProtocolError::Transport(TransportError::ConnReset)) => {
                info!(windows = sequence, "harness closed the stream");
                break Ok(());
            }
            Err(err) => {
                report_protocol_error(&mut *transport, &mut payload, &mut frame, &err);
                break Err(anyhow!(err).context("window receive"));
            }
        }
        if in_bytes.len() != in_len * 4 {
            let info = ErrorInfo::new(
                error_code::BAD_CONFIG,
                format!("window carries {} bytes, expected {}", in_bytes.len(), in_len * 4),
            );
            info.encode(&mut payload);
            let _ = send_frame(&mut *transport, &mut frame, FrameType::Error, &payload);
            break Err(anyhow!("window size mismatch"));
        }
        f32_from_le_bytes(&in_bytes, &mut input);
        let t_in = transport.monotonic_ns();

        let t_start = transport.monotonic_ns();
        if let Err(err) = instance.kernel.process(&input, &mut output) {
            let info = ErrorInfo::new(error_code::KERNEL_EXEC_FAILED, err.to_string());
            info.encode(&mut payload);
            let _ = send_frame(&mut *transport, &mut frame, FrameType::Error, &payload);
            break Err(anyhow!(err).context("kernel process"));
        }
        let t_end = transport.monotonic_ns();

        f32_to_le_bytes(&output, &mut out_bytes);
        let mut result = ResultHeader {
            session_id,
            sequence,
            t_in,
            t_start,
            t_end,
            t_first_tx: transport.monotonic_ns(),
            t_last_tx: 0, // stamped by the send path on the final chunk
            out_window: instance.out_window,
            out_channels: instance.out_channels,
        };
        if let Err(err) =
            send_result_chunks(&mut *transport, &mut payload, &mut frame, &mut result, &out_bytes)
        {
            warn!(sequence, "result send failed: {err}");
            break Err(anyhow!(err).context("result send"));
        }
        sequence += 1;
    };

    // Teardown order: kernel first, then the transport.
    drop(instance);
    transport.close();
    exit
}

fn recv_config(
    transport: &mut dyn Transport,
    reader: &mut FrameReader,
    timeout_ms: u64,
) -> Result<Config> {
    let (ftype, range) = reader
        .read_frame(transport, timeout_ms)
        .context("waiting for CONFIG")?;
    let config = match ftype {
        FrameType::Config => Config::decode(reader.payload(range.clone()))?,
        FrameType::Error => {
            let info = ErrorInfo::decode(reader.payload(range.clone()))?;
            bail!("harness error before CONFIG: {} ({})", info.message, info.code);
        }
        other => bail!("expected CONFIG, got {other:?}"),
    };
    reader.consume_frame(range);
    Ok(config)
}

fn validate_config(config: &Config, opts: &AdapterOptions) -> Result<(), (u32, String)> {
    if Dtype::from_tag(config.dtype).is_err() {
        return Err((
            error_code::BAD_CONFIG,
            format!("unsupported dtype tag {}", config.dtype),
        ));
    }
    if config.window == 0 || config.hop == 0 || config.channels == 0 {
        return Err((
            error_code::BAD_CONFIG,
            "window, hop, and channels must be non-zero".into(),
        ));
    }
    if config.hop > config.window {
        return Err((
            error_code::BAD_CONFIG,
            format!("hop {} exceeds window {}", config.hop, config.window),
        ));
    }
    if config.window > opts.max_window_samples || config.channels > opts.max_channels {
        return Err((
            error_code::BAD_CONFIG,
            format!(
                "shape {}x{} exceeds adapter limits {}x{}",
                config.window, config.channels, opts.max_window_samples, opts.max_channels
            ),
        ));
    }
    if config.calibration.len() > MAX_CALIBRATION_BYTES {
        return Err((
            error_code::CALIBRATION_TOO_BIG,
            format!(
                "calibration state of {} bytes exceeds {}",
                config.calibration.len(),
                MAX_CALIBRATION_BYTES
            ),
        ));
    }
    Ok(())
}

fn report_protocol_error(
    transport: &mut dyn Transport,
    payload: &mut Vec<u8>,
    frame: &mut Vec<u8>,
    err: &ProtocolError,
) {
    let code = match err {
        ProtocolError::VersionMismatch { .. } => error_code::VERSION_MISMATCH,
        ProtocolError::CrcMismatch => error_code::CRC_MISMATCH,
        ProtocolError::SequenceMismatch { .. } => error_code::SEQUENCE_MISMATCH,
        ProtocolError::Incomplete { .. } => error_code::INCOMPLETE,
        ProtocolError::BufferTooSmall { .. } => error_code::BUFFER_TOO_SMALL,
        _ => error_code::BAD_CONFIG,
    };
    let info = ErrorInfo::new(code, err.to_string());
    info.encode(payload);
    let _ = send_frame(transport, frame, FrameType::Error, payload);
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn cpu_model() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(text) = std::fs::read_to_string("/proc/cpuinfo") {
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("model name") {
                    if let Some((_, model)) = rest.split_once(':') {
                        return model.trim().to_string();
                    }
                }
            }
        }
        String::new()
    }
    #[cfg(not(target_os = "linux"))]
    {
        String::new()
    }
}
