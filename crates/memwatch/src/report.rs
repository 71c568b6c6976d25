//! Usage and warning lines, and where they are written.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One line of watchdog output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// Emitted for every sample.
    Usage { used_bytes: u64 },
    /// Emitted when usage is at or above half of the critical threshold.
    Warning { used_bytes: u64, critical_bytes: u64 },
}

impl Report {
    /// Usage in megabytes (1 MB = 1,048,576 bytes).
    pub fn used_mb(&self) -> f64 {
        let used = match self {
            Self::Usage { used_bytes } | Self::Warning { used_bytes, .. } => *used_bytes,
        };
        used as f64 / BYTES_PER_MB
    }

    /// Usage as a percentage of the critical threshold, for warnings.
    pub fn percent_of_critical(&self) -> Option<f64> {
        match self {
            Self::Usage { .. } => None,
            Self::Warning {
                used_bytes,
                critical_bytes,
            } => Some(*used_bytes as f64 / *critical_bytes as f64 * 100.0),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent_of_critical() {
            None => write!(f, "Memory used: {:.2} MB", self.used_mb()),
            Some(percent) => write!(f, "Warning: {percent:.2}% of critical memory in use"),
        }
    }
}

/// Destination for watchdog output lines.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &Report) -> io::Result<()>;
}

impl<T: ReportSink + ?Sized> ReportSink for Arc<T> {
    fn emit(&self, report: &Report) -> io::Result<()> {
        (**self).emit(report)
    }
}

/// Writes each report as a line on standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn emit(&self, report: &Report) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{report}")?;
        out.flush()
    }
}

/// Routes reports through `tracing` instead of writing to stdout directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, report: &Report) -> io::Result<()> {
        match report {
            Report::Usage { used_bytes } => info!(used_bytes, "{report}"),
            Report::Warning {
                used_bytes,
                critical_bytes,
            } => warn!(used_bytes, critical_bytes, "{report}"),
        }
        Ok(())
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    reports: Mutex<Vec<Report>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports captured so far, in emission order.
    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured reports rendered as output lines.
    pub fn lines(&self) -> Vec<String> {
        self.reports().iter().map(ToString::to_string).collect()
    }
}

impl ReportSink for CaptureSink {
    fn emit(&self, report: &Report) -> io::Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*report);
        Ok(())
    }
}
