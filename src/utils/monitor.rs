//! `--monitor`：在階段邊界記錄本行程的 CPU 與記憶體

#[cfg(feature = "cli")]
use std::sync::Mutex;
#[cfg(feature = "cli")]
use std::time::{Duration, Instant};
#[cfg(feature = "cli")]
use sysinfo::{Pid, ProcessesToUpdate, System};

#[cfg(feature = "cli")]
const MB: u64 = 1024 * 1024;

/// 某個時間點的資源快照
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub rss_mb: u64,
    pub rss_delta_mb: i64,
    pub peak_rss_mb: u64,
    pub share_of_total: f32,
    #[cfg(feature = "cli")]
    pub elapsed: Duration,
}

#[cfg(feature = "cli")]
struct Probe {
    system: System,
    pid: Pid,
    last_rss_mb: u64,
    peak_rss_mb: u64,
}

#[cfg(feature = "cli")]
impl Probe {
    fn sample(&mut self, started: Instant) -> Option<ResourceSnapshot> {
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self.system.process(self.pid)?;

        let rss_mb = process.memory() / MB;
        let total_mb = self.system.total_memory() / MB;
        let delta = rss_mb as i64 - self.last_rss_mb as i64;
        self.last_rss_mb = rss_mb;
        self.peak_rss_mb = self.peak_rss_mb.max(rss_mb);

        Some(ResourceSnapshot {
            cpu_percent: process.cpu_usage(),
            rss_mb,
            rss_delta_mb: delta,
            peak_rss_mb: self.peak_rss_mb,
            share_of_total: if total_mb == 0 {
                0.0
            } else {
                rss_mb as f32 * 100.0 / total_mb as f32
            },
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(feature = "cli")]
pub struct SystemMonitor {
    probe: Option<Mutex<Probe>>,
    started: Instant,
}

#[cfg(feature = "cli")]
impl SystemMonitor {
    pub fn new(enabled: bool) -> Self {
        let probe = if enabled {
            match sysinfo::get_current_pid() {
                Ok(pid) => Some(Mutex::new(Probe {
                    system: System::new(),
                    pid,
                    last_rss_mb: 0,
                    peak_rss_mb: 0,
                })),
                Err(e) => {
                    tracing::warn!("⚠️ Cannot resolve current PID, monitoring disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            probe,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        let mut probe = self.probe.as_ref()?.lock().ok()?;
        probe.sample(self.started)
    }

    pub fn log_stats(&self, phase: &str) {
        if let Some(s) = self.snapshot() {
            tracing::info!(
                "📊 {} - CPU: {:.1}%, RSS: {}MB ({:+}MB, {:.1}% of RAM), Peak: {}MB, Time: {:?}",
                phase,
                s.cpu_percent,
                s.rss_mb,
                s.rss_delta_mb,
                s.share_of_total,
                s.peak_rss_mb,
                s.elapsed
            );
        }
    }

    pub fn log_final_stats(&self) {
        if let Some(s) = self.snapshot() {
            tracing::info!(
                "📊 Final Stats - Total Time: {:?}, Peak RSS: {}MB",
                s.elapsed,
                s.peak_rss_mb
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.probe.is_some()
    }
}

#[cfg(not(feature = "cli"))]
pub struct SystemMonitor;

#[cfg(not(feature = "cli"))]
impl SystemMonitor {
    pub fn new(_enabled: bool) -> Self {
        Self
    }

    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        None
    }

    pub fn log_stats(&self, _phase: &str) {}

    pub fn log_final_stats(&self) {}

    pub fn is_enabled(&self) -> bool {
        false
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
