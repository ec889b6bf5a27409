//! Process-level end-to-end tests: the harness engine driving the real
//! `cortex-adapter` binary over a spawned socketpair, exactly as a
//! production `local://` run does.

use cortex_rt::device::{DeviceComm, SessionParams};
use cortex_rt::error::{ProtocolError, TransportError};
use cortex_rt::runner;
use cortex_rt::RunConfig;
use std::path::PathBuf;

fn adapter_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cortex-adapter"))
}

fn eeg_params(plugin: &str) -> SessionParams {
    SessionParams::new(160.0, 160, 80, 64, plugin)
}

#[test]
fn test_spawned_adapter_single_window() {
    let mut device = DeviceComm::spawn(&adapter_bin(), &[], eeg_params("noop")).unwrap();
    assert!(device.child_pid().is_some());
    assert_eq!(device.adapter_name(), "posix");
    assert!(device.hello.kernels.contains(&"noop".to_string()));

    let input = vec![0f32; 160 * 64];
    let mut output = Vec::new();
    let timing = device.dispatch(0, &input, &mut output).unwrap();
    assert!(output.iter().all(|&v| v == 0.0));
    assert!(!timing.deadline_missed);
    assert!(timing.end_ns - timing.start_ns < 500_000_000);

    device.shutdown(2_000);
}

#[test]
fn test_spawned_adapter_ten_windows_in_order() {
    let mut device = DeviceComm::spawn(&adapter_bin(), &[], eeg_params("noop")).unwrap();
    let mut output = Vec::new();
    for index in 0..10u64 {
        let input: Vec<f32> = (0..160 * 64).map(|i| (index * 7 + i) as f32).collect();
        device.dispatch(index, &input, &mut output).unwrap();
        assert_eq!(output, input);
    }
    device.shutdown(2_000);
}

#[test]
fn test_adapter_killed_mid_run_surfaces_conn_reset() {
    let mut device = DeviceComm::spawn(&adapter_bin(), &[], eeg_params("noop")).unwrap();
    let pid = device.child_pid().expect("spawned adapter has a pid") as i32;

    let input = vec![0f32; 160 * 64];
    let mut output = Vec::new();
    for index in 0..4u64 {
        device.dispatch(index, &input, &mut output).unwrap();
    }

    // Kill after window 3; the next dispatch must fail with a reset, not
    // hang or panic.
    unsafe { libc::kill(pid, libc::SIGKILL) };
    let mut saw_reset = false;
    for index in 4..6u64 {
        match device.dispatch(index, &input, &mut output) {
            Err(ProtocolError::Transport(TransportError::ConnReset)) => {
                saw_reset = true;
                break;
            }
            // The first dispatch after the kill may still push its window
            // into the socket buffer and time out instead.
            Err(_) => {
                saw_reset = true;
                break;
            }
            Ok(_) => continue,
        }
    }
    assert!(saw_reset, "dispatch against a dead adapter must fail");

    // Teardown reaps the corpse; a zombie would keep the pid alive in
    // state Z and kill(pid, 0) would still succeed after shutdown.
    device.shutdown(2_000);
    let rc = unsafe { libc::kill(pid, 0) };
    assert_eq!(rc, -1, "adapter pid must be fully reaped");
}

#[test]
fn test_run_kernel_once_writes_telemetry_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = RunConfig::default_example();
    cfg.adapter_bin = Some(adapter_bin());
    cfg.output_dir = dir.path().to_path_buf();
    cfg.duration_secs = 1.0; // 2 windows at Fs=160, H=80 (first fills)
    cfg.warmup_windows = 0;
    cfg.fs = 160.0;
    cfg.window = 160;
    cfg.hop = 80;
    cfg.channels = 8;

    let summary = runner::run_kernel_once(&cfg, "noop", 0).unwrap();
    assert!(summary.abort.is_none());
    assert!(summary.windows_total >= 1);
    assert_eq!(summary.plugin, "noop");

    let telemetry = dir.path().join(format!("{}.jsonl", summary.run_id));
    let text = std::fs::read_to_string(&telemetry).unwrap();
    assert_eq!(text.lines().count() as u64, summary.windows_total);
    for line in text.lines() {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(v["plugin"], "noop");
        assert_eq!(v["channels"], 8);
        // Quantified run invariants: end ≥ start ≥ release, and the exact
        // deadline arithmetic deadline = release + H/Fs.
        let release = v["release_ns"].as_u64().unwrap();
        let start = v["start_ns"].as_u64().unwrap();
        let end = v["end_ns"].as_u64().unwrap();
        let deadline = v["deadline_ns"].as_u64().unwrap();
        assert!(end >= start && start >= release);
        assert_eq!(deadline - release, 500_000_000);
    }

    let summary_path = dir.path().join(format!("{}.summary.json", summary.run_id));
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(summary_path).unwrap()).unwrap();
    assert_eq!(parsed["run_id"], summary.run_id.as_str());
    assert_eq!(parsed["windows_total"], summary.windows_total);
}

#[test]
fn test_run_benchmark_sequential_kernels() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = RunConfig::default_example();
    cfg.kernels = vec!["noop".into(), "car".into()];
    cfg.adapter_bin = Some(adapter_bin());
    cfg.output_dir = dir.path().to_path_buf();
    cfg.duration_secs = 0.75;
    cfg.warmup_windows = 1;
    cfg.channels = 4;

    let summaries = runner::run_benchmark(&cfg).unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.abort.is_none()));
    // One kernel live at a time: runs are strictly sequential, so every
    // telemetry file exists by the time the benchmark returns.
    for s in &summaries {
        assert!(dir.path().join(format!("{}.jsonl", s.run_id)).exists());
    }
}
