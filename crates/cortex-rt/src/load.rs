//! Synthetic background-load profiles.
//!
//! A measurement-environment control: co-scheduled CPU stressor processes
//! pin the host's frequency governor into a known regime so runs taken
//! under `idle`, `medium`, and `heavy` load are comparable. The burners are
//! separate processes (not threads) so they never share the harness's
//! scheduling priority, and they are killed and reaped when the guard
//! drops.

use anyhow::{bail, Result};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    Idle,
    Medium,
    Heavy,
}

impl LoadProfile {
    pub fn name(self) -> &'static str {
        match self {
            LoadProfile::Idle => "idle",
            LoadProfile::Medium => "medium",
            LoadProfile::Heavy => "heavy",
        }
    }

    /// Number of burner processes for this profile on this host.
    fn burner_count(self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            LoadProfile::Idle => 0,
            LoadProfile::Medium => (cores / 4).max(1),
            LoadProfile::Heavy => cores,
        }
    }

    /// Start the stressors. The returned guard owns them.
    pub fn start(self) -> LoadGuard {
        let mut burners = Vec::new();
        for i in 0..self.burner_count() {
            // A portable busy loop under `nice` so the stressors contend for
            // cycles without starving the measurement threads outright.
            match Command::new("sh")
                .arg("-c")
                .arg("exec nice -n 10 sh -c 'while :; do :; done'")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => burners.push(child),
                Err(e) => warn!("failed to start load burner {i}: {e}"),
            }
        }
        if !burners.is_empty() {
            debug!(profile = self.name(), burners = burners.len(), "load profile active");
        }
        LoadGuard { burners }
    }
}

impl FromStr for LoadProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "idle" => LoadProfile::Idle,
            "medium" => LoadProfile::Medium,
            "heavy" => LoadProfile::Heavy,
            other => bail!("unknown load profile {other:?} (idle|medium|heavy)"),
        })
    }
}

/// Kills and reaps the burner processes on drop.
pub struct LoadGuard {
    burners: Vec<Child>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        for child in &mut self.burners {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
