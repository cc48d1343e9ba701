//! Ordering barriers for the single command queue.
//!
//! The guard is the only place in the crate that drains or flushes the
//! device. Every host read of device memory must pass through
//! [`SyncGuard::synchronize_before_read`] first; disposal paths use the
//! tolerant variant so release always makes progress.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::GpuHandle;
use crate::error::Result;

/// Default deadline for [`SyncGuard::wait_event`].
pub const EVENT_DEADLINE: Duration = Duration::from_secs(30);

/// Waits longer than this are logged as slow.
const SLOW_SYNC: Duration = Duration::from_secs(1);

/// A marker enqueued behind all previously submitted commands. Completion
/// implies everything before it has completed.
pub struct SyncEvent {
    rx: mpsc::Receiver<()>,
    label: String,
    created: Instant,
}

pub struct SyncGuard {
    handle: Arc<GpuHandle>,
}

impl SyncGuard {
    pub(crate) fn new(handle: Arc<GpuHandle>) -> Self {
        Self { handle }
    }

    /// Block until every previously enqueued command has completed.
    ///
    /// Must be called before any host access to device memory.
    pub fn synchronize_before_read(&self, label: &str) -> Result<()> {
        let start = Instant::now();
        self.handle.device.poll(wgpu::Maintain::Wait);
        let elapsed = start.elapsed();
        if elapsed > SLOW_SYNC {
            warn!("slow sync `{}`: {:?}", label, elapsed);
        } else {
            debug!("sync `{}` in {:?}", label, elapsed);
        }
        Ok(())
    }

    /// Same wait, but failures are logged rather than raised: disposal must
    /// make progress even on a wedged queue.
    pub fn synchronize_before_dispose(&self, label: &str, bytes: u64) {
        if let Err(e) = self.synchronize_before_read(label) {
            warn!("sync before dispose `{}` ({} bytes) failed: {}", label, bytes, e);
        }
    }

    /// Enqueue a completion marker behind all submitted work.
    pub fn insert_marker(&self, label: &str) -> SyncEvent {
        let (tx, rx) = mpsc::channel();
        self.handle.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        SyncEvent {
            rx,
            label: label.to_string(),
            created: Instant::now(),
        }
    }

    /// Wait for a marker with a deadline. Returns `Ok(true)` on completion,
    /// `Ok(false)` on timeout (logged); the caller decides whether a
    /// timeout is fatal for its step.
    pub fn wait_event(&self, event: &SyncEvent, label: &str, timeout: Duration) -> Result<bool> {
        // The callback only fires once the queue makes progress.
        self.handle.device.poll(wgpu::Maintain::Wait);
        match event.rx.recv_timeout(timeout) {
            Ok(()) => {
                let elapsed = event.created.elapsed();
                if elapsed > SLOW_SYNC {
                    warn!("slow event `{}` ({}): {:?}", event.label, label, elapsed);
                }
                Ok(true)
            }
            Err(_) => {
                warn!(
                    "event `{}` ({}) did not complete within {:?}",
                    event.label, label, timeout
                );
                Ok(false)
            }
        }
    }
}

impl std::fmt::Debug for SyncGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SyncGuard")
    }
}
