//! End-to-end loopback: harness and adapter at the two ends of a
//! socketpair, the adapter running the real window loop on a thread. This
//! exercises the full path — handshake, chunked windows, kernel execution,
//! chunked results, teardown — without spawning processes.

use cortex_rt::adapter::{self, AdapterOptions};
use cortex_rt::device::{DeviceComm, SessionParams};
use cortex_rt::error::{ProtocolError, TransportError};
use cortex_rt::plugin::{kernels, CalibrationState, Registry};
use cortex_rt::transport::{fd_socketpair, FdTransport, Transport};
use cortex_rt::wire::chunk::{recv_window_chunks, send_result_chunks};
use cortex_rt::wire::{
    error_code, send_frame, Ack, Config, FrameReader, FrameType, Hello, ResultHeader,
};
use std::thread::JoinHandle;

fn adapter_options() -> AdapterOptions {
    AdapterOptions {
        window_timeout_ms: 3_000,
        config_timeout_ms: 3_000,
        ..AdapterOptions::default()
    }
}

/// Start the real adapter loop on a thread; returns the harness-side FD
/// transport and the adapter's join handle.
fn start_adapter() -> (FdTransport, JoinHandle<anyhow::Result<()>>) {
    let (harness_fd, adapter_fd) = fd_socketpair().unwrap();
    let handle = std::thread::Builder::new()
        .name("loopback-adapter".into())
        .spawn(move || {
            let transport = Box::new(FdTransport::from_owned(adapter_fd, adapter_fd));
            adapter::run(transport, &Registry::builtin(), &adapter_options())
        })
        .unwrap();
    (FdTransport::from_owned(harness_fd, harness_fd), handle)
}

fn eeg_params(plugin: &str) -> SessionParams {
    // The S1/S2 shape: Fs=160, W=160, H=80, C=64.
    SessionParams::new(160.0, 160, 80, 64, plugin)
}

#[test]
fn test_noop_single_zero_window() {
    let (transport, handle) = start_adapter();
    let mut device =
        DeviceComm::over_transport(Box::new(transport), eeg_params("noop")).unwrap();
    assert_eq!(device.out_window, 160);
    assert_eq!(device.out_channels, 64);

    let input = vec![0f32; 160 * 64];
    let mut output = Vec::new();
    let timing = device.dispatch(0, &input, &mut output).unwrap();

    assert_eq!(output.len(), 160 * 64);
    assert!(output.iter().all(|&v| v == 0.0));
    // Harness clock ordering and the exact deadline arithmetic.
    assert!(timing.end_ns >= timing.start_ns);
    assert!(timing.start_ns >= timing.release_ns);
    assert_eq!(timing.deadline_ns - timing.release_ns, 500_000_000); // H/Fs
    assert!(!timing.deadline_missed);
    assert!(timing.end_ns - timing.start_ns < 500_000_000);
    // Device clock ordering.
    assert!(timing.t_in <= timing.t_start);
    assert!(timing.t_start <= timing.t_end);
    assert!(timing.t_end <= timing.t_first_tx);
    assert!(timing.t_first_tx <= timing.t_last_tx);

    device.shutdown(1_000);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_ten_sequential_windows_chunked_both_ways() {
    let (transport, handle) = start_adapter();
    let mut device =
        DeviceComm::over_transport(Box::new(transport), eeg_params("noop")).unwrap();

    // 160 × 64 × 4 = 40 960 bytes per window: five 8 KiB chunks each way.
    let mut output = Vec::new();
    for index in 0..10u64 {
        let input: Vec<f32> = (0..160 * 64)
            .map(|i| (index as f32) * 1000.0 + i as f32)
            .collect();
        let timing = device.dispatch(index, &input, &mut output).unwrap();
        assert_eq!(output, input, "window {index} must round-trip bit-exact");
        assert!(timing.end_ns >= timing.release_ns);
    }

    device.shutdown(1_000);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_car_loopback_subtracts_row_mean() {
    let (transport, handle) = start_adapter();
    let mut device = DeviceComm::over_transport(
        Box::new(transport),
        SessionParams::new(160.0, 4, 2, 8, "primitives/kernels/v1/car@f32"),
    )
    .unwrap();

    let input = vec![2.0f32; 4 * 8];
    let mut output = Vec::new();
    device.dispatch(0, &input, &mut output).unwrap();
    // Constant rows become zero after mean removal.
    assert!(output.iter().all(|&v| v == 0.0));

    device.shutdown(1_000);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_decim_reports_reduced_shape_in_ack() {
    let (transport, handle) = start_adapter();
    let mut device = DeviceComm::over_transport(
        Box::new(transport),
        SessionParams::new(160.0, 160, 80, 4, "decim"),
    )
    .unwrap();
    assert_eq!(device.out_window, 80);
    assert_eq!(device.out_channels, 4);

    let input: Vec<f32> = (0..160 * 4).map(|i| i as f32).collect();
    let mut output = Vec::new();
    device.dispatch(0, &input, &mut output).unwrap();
    assert_eq!(output.len(), 80 * 4);
    assert_eq!(&output[..4], &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(&output[4..8], &[8.0, 9.0, 10.0, 11.0]);

    device.shutdown(1_000);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_unknown_kernel_rejected_at_handshake() {
    let (transport, handle) = start_adapter();
    let err = DeviceComm::over_transport(Box::new(transport), eeg_params("wavelet"))
        .err()
        .expect("handshake must fail for an unknown kernel");
    let text = format!("{err:#}");
    assert!(text.contains("unknown kernel"), "got: {text}");
    assert!(handle.join().unwrap().is_err());
}

#[test]
fn test_trainable_kernel_refuses_to_start_uncalibrated() {
    let (transport, handle) = start_adapter();
    let err = DeviceComm::over_transport(Box::new(transport), eeg_params("baseline"))
        .err()
        .expect("baseline must not start without calibration state");
    let text = format!("{err:#}");
    assert!(text.contains("calibration"), "got: {text}");
    assert!(handle.join().unwrap().is_err());
}

#[test]
fn test_calibration_round_trip_through_state_file() {
    // Offline phase: train on a constant signal, persist, reload.
    let cfg = cortex_rt::plugin::KernelConfig {
        abi_version: cortex_rt::plugin::ABI_VERSION,
        fs: 160.0,
        window: 160,
        hop: 80,
        channels: 64,
        dtype: cortex_rt::plugin::Dtype::F32,
        in_place: false,
        params: "",
        calibration: None,
    };
    let training = vec![vec![0.25f32; 160 * 64]; 4];
    let (blob, state_version) = Registry::builtin()
        .calibrate("baseline", &cfg, &training)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baseline.cal");
    CalibrationState::new(state_version, blob).write_file(&path).unwrap();
    let state = CalibrationState::read_file(&path).unwrap();
    assert_eq!(state.state_version, kernels::BASELINE_STATE_VERSION);

    // Online phase: a fresh adapter must ACK with the state loaded.
    let (transport, handle) = start_adapter();
    let mut params = eeg_params("baseline");
    params.calibration = state.data;
    let mut device = DeviceComm::over_transport(Box::new(transport), params).unwrap();

    let input = vec![0.25f32; 160 * 64];
    let mut output = Vec::new();
    device.dispatch(0, &input, &mut output).unwrap();
    // The trained offset removes the constant baseline exactly.
    assert!(output.iter().all(|&v| v == 0.0));

    device.shutdown(1_000);
    handle.join().unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Transport wrapper that flips one payload bit in the nth send call.
struct BitFlip<T: Transport> {
    inner: T,
    sends: usize,
    flip_on: usize,
}

impl<T: Transport> Transport for BitFlip<T> {
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.sends += 1;
        if self.sends == self.flip_on && buf.len() > 20 {
            let mut corrupted = buf.to_vec();
            // Flip a bit inside the payload, past the 16-byte header.
            corrupted[20] ^= 0x01;
            // Forward the whole corrupted frame.
            let mut remaining: &[u8] = &corrupted;
            while !remaining.is_empty() {
                let n = self.inner.send(remaining)?;
                remaining = &remaining[n..];
            }
            return Ok(buf.len());
        }
        self.inner.send(buf)
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, TransportError> {
        self.inner.recv(buf, timeout_ms)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[test]
fn test_crc_corruption_aborts_the_window_exchange() {
    let (transport, handle) = start_adapter();
    // Send #1 is CONFIG; the five window chunks are #2..#6. Corrupt the
    // last chunk so the harness is already in its receive when the adapter
    // reports the mismatch.
    let corrupting = BitFlip {
        inner: transport,
        sends: 0,
        flip_on: 6,
    };
    let mut device =
        DeviceComm::over_transport(Box::new(corrupting), eeg_params("noop")).unwrap();

    let input = vec![1.0f32; 160 * 64];
    let mut output = Vec::new();
    match device.dispatch(0, &input, &mut output) {
        // The adapter rejects the frame and reports the mismatch instead of
        // producing a result.
        Err(ProtocolError::Remote { code, .. }) => {
            assert_eq!(code, error_code::CRC_MISMATCH);
        }
        other => panic!("expected remote CRC_MISMATCH, got {other:?}"),
    }
    drop(device);
    assert!(handle.join().unwrap().is_err());
}

/// Minimal hand-rolled adapter that completes the handshake and then
/// answers every window with a RESULT carrying the wrong session id —
/// the signature of an adapter that restarted mid-run.
fn start_stale_session_adapter() -> (FdTransport, JoinHandle<()>) {
    let (harness_fd, adapter_fd) = fd_socketpair().unwrap();
    let handle = std::thread::Builder::new()
        .name("stale-adapter".into())
        .spawn(move || {
            let mut transport = FdTransport::from_owned(adapter_fd, adapter_fd);
            let mut reader = FrameReader::new();
            let mut payload = Vec::new();
            let mut frame = Vec::new();

            let hello = Hello {
                boot_id: 7,
                adapter_name: "stale".into(),
                abi_version: cortex_rt::plugin::ABI_VERSION,
                max_window_samples: 65_536,
                max_channels: 1_024,
                hostname: String::new(),
                cpu: String::new(),
                os: String::new(),
                kernels: vec!["noop".into()],
            };
            hello.encode(&mut payload);
            send_frame(&mut transport, &mut frame, FrameType::Hello, &payload).unwrap();

            let (ftype, range) = reader.read_frame(&mut transport, 3_000).unwrap();
            assert_eq!(ftype, FrameType::Config);
            let config = Config::decode(reader.payload(range.clone())).unwrap();
            reader.consume_frame(range);

            Ack {
                out_window: config.window,
                out_channels: config.channels as u32,
            }
            .encode(&mut payload);
            send_frame(&mut transport, &mut frame, FrameType::Ack, &payload).unwrap();

            let cap = config.window * config.channels as u32 * 4;
            let mut window_bytes = Vec::new();
            recv_window_chunks(&mut transport, &mut reader, 0, cap, &mut window_bytes, 3_000)
                .unwrap();

            // A restarted adapter answers under its own fresh session id.
            let mut result = ResultHeader {
                session_id: config.session_id.wrapping_add(1),
                sequence: 0,
                t_in: 1,
                t_start: 2,
                t_end: 3,
                t_first_tx: 4,
                t_last_tx: 0,
                out_window: config.window,
                out_channels: config.channels as u32,
            };
            send_result_chunks(&mut transport, &mut payload, &mut frame, &mut result, &window_bytes)
                .unwrap();
        })
        .unwrap();
    (FdTransport::from_owned(harness_fd, harness_fd), handle)
}

#[test]
fn test_session_mismatch_detected_on_result() {
    let (transport, handle) = start_stale_session_adapter();
    let mut device =
        DeviceComm::over_transport(Box::new(transport), eeg_params("noop")).unwrap();

    let input = vec![0f32; 160 * 64];
    let mut output = Vec::new();
    match device.dispatch(0, &input, &mut output) {
        Err(ProtocolError::SessionMismatch { expected, got }) => {
            assert_ne!(expected, got);
        }
        other => panic!("expected SessionMismatch, got {other:?}"),
    }
    drop(device);
    handle.join().unwrap();
}

/// Adapter that handshakes and then goes silent: the dispatch must time out
/// rather than hang.
#[test]
fn test_silent_adapter_surfaces_timeout() {
    let (harness_fd, adapter_fd) = fd_socketpair().unwrap();
    let handle = std::thread::Builder::new()
        .name("silent-adapter".into())
        .spawn(move || {
            let mut transport = FdTransport::from_owned(adapter_fd, adapter_fd);
            let mut reader = FrameReader::new();
            let mut payload = Vec::new();
            let mut frame = Vec::new();
            let hello = Hello {
                boot_id: 1,
                adapter_name: "silent".into(),
                abi_version: cortex_rt::plugin::ABI_VERSION,
                max_window_samples: 65_536,
                max_channels: 1_024,
                hostname: String::new(),
                cpu: String::new(),
                os: String::new(),
                kernels: vec!["noop".into()],
            };
            hello.encode(&mut payload);
            send_frame(&mut transport, &mut frame, FrameType::Hello, &payload).unwrap();
            let (ftype, range) = reader.read_frame(&mut transport, 3_000).unwrap();
            assert_eq!(ftype, FrameType::Config);
            reader.consume_frame(range);
            Ack {
                out_window: 160,
                out_channels: 64,
            }
            .encode(&mut payload);
            send_frame(&mut transport, &mut frame, FrameType::Ack, &payload).unwrap();
            // Swallow the window and never answer. Keep the FD open long
            // enough for the harness timeout to fire first.
            std::thread::sleep(std::time::Duration::from_millis(2_000));
        })
        .unwrap();

    let mut params = eeg_params("noop");
    params.result_grace_ms = 100;
    let mut device = DeviceComm::over_transport(
        Box::new(FdTransport::from_owned(harness_fd, harness_fd)),
        params,
    )
    .unwrap();

    let input = vec![0f32; 160 * 64];
    let mut output = Vec::new();
    let start = std::time::Instant::now();
    match device.dispatch(0, &input, &mut output) {
        Err(err) if err.is_timeout() => {}
        other => panic!("expected timeout, got {other:?}"),
    }
    // Deadline (500 ms) + grace, not the 10 s outer ceiling.
    assert!(start.elapsed().as_millis() < 5_000);
    drop(device);
    handle.join().unwrap();
}
