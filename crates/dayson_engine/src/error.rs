//! Engine error taxonomy.
//!
//! Every fallible path in the engine funnels into [`EngineError`]. The
//! variants mirror the failure classes that cross the component boundary:
//! storage lookups, on-disk corruption, raw I/O, device faults, resource
//! exhaustion, timeouts, bad arguments, and the pre-training sanity gate.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The requested tensor id (or swap path) is not registered anywhere.
    #[error("not found: {0}")]
    NotFound(String),

    /// On-disk bytes disagree with what the index or the format promises.
    #[error("corrupt data in {path:?}: {detail}")]
    CorruptData { path: PathBuf, detail: String },

    #[error("i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Kernel or queue level fault on the compute device.
    #[error("device failure in `{kernel}`: {detail}")]
    DeviceFailure { kernel: String, detail: String },

    /// The target filesystem cannot hold the payload plus headroom.
    #[error("out of space: need {needed} bytes, {available} available")]
    OutOfSpace { needed: u64, available: u64 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// An event wait exceeded its deadline. Treated as a device failure by
    /// callers; kept separate so logs can tell the two apart.
    #[error("timeout waiting on `{0}`")]
    Timeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The one-shot self test failed; training must not start.
    #[error("sanity check failed: {0}")]
    SanityFailed(String),
}

impl EngineError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        EngineError::CorruptData {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn device(kernel: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::DeviceFailure {
            kernel: kernel.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn inner() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))?;
            Ok(())
        }
        match inner() {
            Err(EngineError::IoFailure(_)) => {}
            other => panic!("expected IoFailure, got {:?}", other),
        }
    }
}
