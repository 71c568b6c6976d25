//! memwatch: process memory watchdog
//!
//! Samples the process's memory usage on a background thread, prints the
//! reading once per interval and warns once usage reaches half of a critical
//! threshold. The loop stops cooperatively: `stop` sets a cancellation signal
//! that also interrupts the wait between samples.
//!
//! ```no_run
//! use std::sync::Arc;
//! use memwatch::MemoryWatchdog;
//!
//! let watchdog = Arc::new(MemoryWatchdog::new(50 * 1024 * 1024)?);
//! let handle = watchdog.spawn()?;
//! // ... workload ...
//! handle.stop_and_join()?;
//! watchdog.close();
//! # Ok::<(), memwatch::WatchdogError>(())
//! ```

mod config;
mod error;
mod probe;
mod report;
mod signal;
mod watchdog;

pub use config::{ConfigError, DEFAULT_CRITICAL_BYTES, DEFAULT_INTERVAL_MILLIS, WatchdogConfig};
pub use error::{ProbeError, WatchdogError};
pub use probe::{AllocStats, AllocatorProbe, FnProbe, MemoryProbe, ProcessRss, TrackingAllocator};
pub use report::{CaptureSink, Report, ReportSink, StdoutSink, TracingSink};
pub use signal::CancelSignal;
pub use watchdog::{MemoryWatchdog, WatchdogHandle};
