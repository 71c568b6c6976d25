//! Error types for the memory watchdog.

use crate::config::ConfigError;

/// Errors surfaced by [`MemoryWatchdog`](crate::MemoryWatchdog) operations.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    /// The critical threshold was zero or negative.
    #[error("critical threshold must be positive, got {0}")]
    InvalidArgument(i64),

    /// The watchdog was already closed.
    #[error("memory watchdog is closed")]
    ClosedResource,

    /// A sampling thread is already attached to this watchdog.
    #[error("memory watchdog is already running")]
    AlreadyRunning,

    /// The OS refused to create the sampling thread.
    #[error("failed to spawn watchdog thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The sampling thread panicked before returning.
    #[error("watchdog thread panicked")]
    Panicked,

    /// The supplied configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from a memory sampling primitive.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The current process was not found in the system process table.
    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    /// The probe has no reading to report.
    #[error("memory reading unavailable: {0}")]
    Unavailable(String),
}
