//! Host memory probe and trim bookkeeping.
//!
//! Polling is rate-limited to 1 Hz and degrades gracefully where no
//! RSS source exists (non-Linux hosts report nothing and the trim policy
//! simply never fires).

use std::time::{Duration, Instant};

use tracing::debug;

pub struct MemoryMonitor {
    last_poll: Instant,
    cache: Option<u64>,
    baseline_mb: u64,
    trim_threshold_mb: u64,
    growth_gate_mb: u64,
}

impl MemoryMonitor {
    pub fn new(trim_threshold_mb: u64, growth_gate_mb: u64) -> Self {
        let baseline = read_rss_mb().unwrap_or(0);
        debug!("memory monitor baseline {} MiB", baseline);
        Self {
            last_poll: Instant::now()
                .checked_sub(Duration::from_secs(2))
                .unwrap_or_else(Instant::now),
            cache: None,
            baseline_mb: baseline,
            trim_threshold_mb,
            growth_gate_mb,
        }
    }

    /// Resident set size in MiB, rate limited to 1 Hz.
    pub fn poll_rss_mb(&mut self) -> Option<u64> {
        if self.last_poll.elapsed() < Duration::from_secs(1) {
            return self.cache;
        }
        self.last_poll = Instant::now();
        self.cache = read_rss_mb();
        self.cache
    }

    /// Trim only when resident memory is both above the absolute threshold
    /// and has grown at least one gate step since the last baseline.
    pub fn should_trim(&self, rss_mb: u64) -> bool {
        rss_mb > self.trim_threshold_mb && rss_mb >= self.baseline_mb + self.growth_gate_mb
    }

    pub fn record_baseline(&mut self, rss_mb: u64) {
        self.baseline_mb = rss_mb;
    }
}

#[cfg(target_os = "linux")]
fn read_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_rss_mb() -> Option<u64> {
    None
}
