//! Scheduler: window formation and sequential dispatch.
//!
//! Consumes hops from the replayer channel, maintains a rolling buffer of
//! the most recent W samples per channel, and produces one overlapping
//! window per hop once W samples have accumulated. Each window goes through
//! device-comm synchronously — exactly one outstanding window, never
//! parallel dispatch; cross-kernel comparisons come from running kernels in
//! succession under identical conditions.
//!
//! Transport timeouts are absorbed locally (recorded as missed windows)
//! until the timeout budget runs out; every other protocol error aborts the
//! run. A leading warmup prefix is flagged in telemetry and excluded from
//! statistics.

use crate::device::DeviceComm;
use crate::error::ProtocolError;
use crate::replayer::Hop;
use crate::telemetry::{TelemetryWriter, WindowRecord};
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub window: u32,
    pub hop: u32,
    pub channels: u32,
    pub fs: f32,
    /// Leading windows flagged `warmup` and excluded from statistics.
    pub warmup_windows: u32,
    /// Recoverable transport timeouts tolerated before the run aborts.
    pub timeout_budget: u32,
    /// Request SCHED_FIFO at this priority for the dispatch thread.
    pub rt_priority: Option<i32>,
    /// Pin the dispatch thread to this core.
    pub pin_core: Option<usize>,
}

/// Identity fields stamped into every record of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub plugin: String,
    pub dtype: String,
    pub load_profile: String,
    pub repeat: u32,
    pub adapter: String,
}

/// Drive the dispatch loop until the replayer finishes or the run aborts.
/// Returns all records plus the abort cause, if any.
pub fn run_dispatch_loop(
    rx: &Receiver<Hop>,
    device: &mut DeviceComm,
    writer: &mut TelemetryWriter,
    cfg: &SchedulerConfig,
    ctx: &RunContext,
) -> (Vec<WindowRecord>, Option<String>) {
    apply_rt_controls(cfg);

    let window_len = cfg.window as usize * cfg.channels as usize;
    let mut rolling: Vec<f32> = Vec::with_capacity(window_len + cfg.hop as usize * cfg.channels as usize);
    let mut window = vec![0f32; window_len];
    let mut output: Vec<f32> = Vec::with_capacity(device.output_len());
    let mut records: Vec<WindowRecord> = Vec::new();
    let mut window_index = 0u64;
    let mut timeouts_left = cfg.timeout_budget;

    for hop in rx {
        rolling.extend_from_slice(&hop.samples);
        let excess = rolling.len().saturating_sub(window_len);
        if excess > 0 {
            rolling.drain(..excess);
        }
        if rolling.len() < window_len {
            continue;
        }
        window.copy_from_slice(&rolling);

        let warmup = window_index < cfg.warmup_windows as u64;
        match device.dispatch(window_index, &window, &mut output) {
            Ok(timing) => {
                let rec = WindowRecord {
                    run_id: ctx.run_id.clone(),
                    plugin: ctx.plugin.clone(),
                    dtype: ctx.dtype.clone(),
                    window_index,
                    release_ns: timing.release_ns,
                    deadline_ns: timing.deadline_ns,
                    start_ns: timing.start_ns,
                    end_ns: timing.end_ns,
                    deadline_missed: timing.deadline_missed,
                    t_in: timing.t_in,
                    t_start: timing.t_start,
                    t_end: timing.t_end,
                    t_first_tx: timing.t_first_tx,
                    t_last_tx: timing.t_last_tx,
                    window: cfg.window,
                    hop: cfg.hop,
                    channels: cfg.channels,
                    fs: cfg.fs,
                    load_profile: ctx.load_profile.clone(),
                    repeat: ctx.repeat,
                    warmup,
                    adapter: ctx.adapter.clone(),
                    error: None,
                };
                append(writer, &rec);
                records.push(rec);
            }
            Err(err) if err.is_timeout() => {
                let now = crate::clock::now_ns();
                let deadline_ns = now; // best effort; the true deadline passed already
                let rec = WindowRecord {
                    run_id: ctx.run_id.clone(),
                    plugin: ctx.plugin.clone(),
                    dtype: ctx.dtype.clone(),
                    window_index,
                    release_ns: hop.release_ns,
                    deadline_ns,
                    start_ns: hop.release_ns,
                    end_ns: now,
                    deadline_missed: true,
                    t_in: 0,
                    t_start: 0,
                    t_end: 0,
                    t_first_tx: 0,
                    t_last_tx: 0,
                    window: cfg.window,
                    hop: cfg.hop,
                    channels: cfg.channels,
                    fs: cfg.fs,
                    load_profile: ctx.load_profile.clone(),
                    repeat: ctx.repeat,
                    warmup,
                    adapter: ctx.adapter.clone(),
                    error: Some("timeout".into()),
                };
                append(writer, &rec);
                records.push(rec);
                if timeouts_left == 0 {
                    warn!(window_index, "timeout budget exhausted, aborting run");
                    return (records, Some("timeout_budget_exhausted".into()));
                }
                timeouts_left -= 1;
                warn!(window_index, timeouts_left, "window timed out, continuing");
            }
            Err(err) => {
                warn!(window_index, "fatal protocol error: {err}");
                return (records, Some(err.tag().to_string()));
            }
        }
        window_index += 1;
    }

    info!(windows = window_index, "replay drained, run complete");
    (records, None)
}

fn append(writer: &mut TelemetryWriter, rec: &WindowRecord) {
    // Telemetry loss must not kill a measurement mid-run; the summary will
    // still be computed from the in-memory records.
    if let Err(e) = writer.append(rec).and_then(|_| writer.flush()) {
        warn!(window_index = rec.window_index, "telemetry write failed: {e}");
    }
}

/// Best-effort real-time controls. Refusal (no privilege, no RT scheduler)
/// is logged and never aborts the run.
fn apply_rt_controls(cfg: &SchedulerConfig) {
    #[cfg(target_os = "linux")]
    {
        if let Some(priority) = cfg.rt_priority {
            let param = libc::sched_param {
                sched_priority: priority,
            };
            let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
            if rc == 0 {
                info!(priority, "dispatch thread running SCHED_FIFO");
            } else {
                warn!(
                    priority,
                    "SCHED_FIFO request refused: {} (continuing best-effort)",
                    std::io::Error::last_os_error()
                );
            }
        }
        if let Some(core) = cfg.pin_core {
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_SET(core, &mut set);
                if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0 {
                    debug!(core, "dispatch thread pinned");
                } else {
                    warn!(core, "pin failed: {}", std::io::Error::last_os_error());
                }
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if cfg.rt_priority.is_some() || cfg.pin_core.is_some() {
            warn!("real-time controls are linux-only; continuing best-effort");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Window-formation logic, isolated from device-comm: same rolling
    // buffer discipline as the dispatch loop.
    fn form_windows(hops: &[Vec<f32>], window_len: usize) -> Vec<Vec<f32>> {
        let mut rolling: Vec<f32> = Vec::new();
        let mut out = Vec::new();
        for hop in hops {
            rolling.extend_from_slice(hop);
            let excess = rolling.len().saturating_sub(window_len);
            if excess > 0 {
                rolling.drain(..excess);
            }
            if rolling.len() == window_len {
                out.push(rolling.clone());
            }
        }
        out
    }

    #[test]
    fn test_window_forms_only_after_fill() {
        // W=4 samples, 1 channel, H=2.
        let hops = vec![vec![1., 2.], vec![3., 4.], vec![5., 6.]];
        let windows = form_windows(&hops, 4);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], vec![1., 2., 3., 4.]);
        // Next window overlaps by W−H = 2 samples.
        assert_eq!(windows[1], vec![3., 4., 5., 6.]);
    }

    #[test]
    fn test_window_equal_hop_no_overlap() {
        let hops = vec![vec![1., 2.], vec![3., 4.], vec![5., 6.]];
        let windows = form_windows(&hops, 2);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2], vec![5., 6.]);
    }

    #[test]
    fn test_rt_controls_never_abort() {
        // Unprivileged request must be survivable.
        apply_rt_controls(&SchedulerConfig {
            window: 4,
            hop: 2,
            channels: 1,
            fs: 100.0,
            warmup_windows: 0,
            timeout_budget: 0,
            rt_priority: Some(40),
            pin_core: Some(0),
        });
    }
}
