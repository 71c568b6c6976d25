//! Memory watchdog: the sampling loop and its lifecycle.
//!
//! Lifecycle:
//! - **Active**: constructed, `run` allowed.
//! - **Closed**: terminal; `run` and `spawn` fail with `ClosedResource`.
//!
//! Cancellation is a separate one-way signal set by `stop` (and by `close`).
//! The loop checks it before every sample and waits on it between samples, so
//! a stop takes effect within one interval at most.

use crate::config::{ConfigError, WatchdogConfig};
use crate::error::WatchdogError;
use crate::probe::{MemoryProbe, ProcessRss};
use crate::report::{Report, ReportSink, StdoutSink};
use crate::signal::CancelSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Periodically samples process memory and reports it.
pub struct MemoryWatchdog {
    critical_bytes: u64,
    interval: Duration,
    cancel: CancelSignal,
    closed: AtomicBool,
    /// Set while a loop owns this watchdog
    running: AtomicBool,
    probe: Box<dyn MemoryProbe>,
    sink: Box<dyn ReportSink>,
}

impl MemoryWatchdog {
    /// Create a watchdog with the given critical threshold in bytes.
    ///
    /// Samples process RSS once per second and writes lines to stdout.
    pub fn new(critical_bytes: i64) -> Result<Self, WatchdogError> {
        Self::with_config(&WatchdogConfig::with_critical_bytes(critical_bytes))
    }

    /// Create a watchdog from a full configuration.
    pub fn with_config(config: &WatchdogConfig) -> Result<Self, WatchdogError> {
        match config.validate() {
            Ok(()) => {}
            Err(ConfigError::NonPositiveThreshold(value)) => {
                return Err(WatchdogError::InvalidArgument(value));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            critical_bytes: config.critical_bytes.unsigned_abs(),
            interval: config.interval(),
            cancel: CancelSignal::new(),
            closed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            probe: Box::new(ProcessRss::new()),
            sink: Box::new(StdoutSink),
        })
    }

    /// Replace the memory sampling source.
    pub fn with_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Replace the output destination.
    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn critical_bytes(&self) -> u64 {
        self.critical_bytes
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether a sampling loop is currently attached.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reports produced by a single reading of `used_bytes`.
    ///
    /// The usage line is always present; the warning follows once usage
    /// reaches half of the critical threshold.
    pub fn assess(&self, used_bytes: u64) -> impl Iterator<Item = Report> + use<> {
        let usage = Report::Usage { used_bytes };
        let warning = at_warning_level(used_bytes, self.critical_bytes).then_some(Report::Warning {
            used_bytes,
            critical_bytes: self.critical_bytes,
        });
        std::iter::once(usage).chain(warning)
    }

    /// Run the sampling loop on the calling thread until stopped.
    pub fn run(&self) -> Result<(), WatchdogError> {
        self.claim()?;
        let _running = RunGuard(&self.running);
        self.sample_loop();
        Ok(())
    }

    /// Run the sampling loop on a dedicated thread.
    ///
    /// The thread keeps its own reference to the watchdog, so the returned
    /// handle (not the watchdog's drop) is what stops and joins it.
    pub fn spawn(self: &Arc<Self>) -> Result<WatchdogHandle, WatchdogError> {
        self.claim()?;

        let watchdog = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("memory-watchdog".to_string())
            .spawn(move || {
                let _running = RunGuard(&watchdog.running);
                watchdog.sample_loop();
            });

        match spawned {
            Ok(thread) => Ok(WatchdogHandle {
                watchdog: Arc::clone(self),
                thread: Some(thread),
            }),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(WatchdogError::Spawn(e))
            }
        }
    }

    /// Request the sampling loop to exit. Safe to call any number of times.
    ///
    /// Returns `true` only for the call that set the cancellation signal.
    pub fn stop(&self) -> bool {
        let first = self.cancel.cancel();
        if first {
            debug!("Memory watchdog stop requested");
        }
        first
    }

    /// Close the watchdog and stop any loop. Safe to call any number of times.
    ///
    /// Returns `true` only for the call that moved the watchdog to Closed.
    pub fn close(&self) -> bool {
        // Cancel before publishing `closed`, so a closed watchdog is always
        // a cancelled one and the loop cannot start another sample.
        self.stop();
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Memory watchdog closed");
        true
    }

    fn claim(&self) -> Result<(), WatchdogError> {
        if self.is_closed() {
            return Err(WatchdogError::ClosedResource);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WatchdogError::AlreadyRunning);
        }
        Ok(())
    }

    fn sample_loop(&self) {
        info!(
            critical_bytes = self.critical_bytes,
            interval_ms = self.interval.as_millis() as u64,
            "Memory watchdog started"
        );

        while !self.cancel.is_cancelled() {
            self.sample_once();
            if self.cancel.wait_timeout(self.interval) {
                break;
            }
        }

        info!("Memory watchdog stopped");
    }

    fn sample_once(&self) {
        let used_bytes = match self.probe.sample() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Memory sample failed, skipping");
                return;
            }
        };

        for report in self.assess(used_bytes) {
            if let Err(e) = self.sink.emit(&report) {
                warn!(error = %e, "Failed to write watchdog report");
            }
        }
    }
}

impl Drop for MemoryWatchdog {
    fn drop(&mut self) {
        self.close();
    }
}

/// True once `used_bytes >= critical_bytes / 2`, computed without rounding.
fn at_warning_level(used_bytes: u64, critical_bytes: u64) -> bool {
    u128::from(used_bytes) * 2 >= u128::from(critical_bytes)
}

/// Clears the running flag when the loop exits, even by unwinding.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns a spawned sampling thread.
///
/// Dropping the handle stops the loop and joins the thread.
pub struct WatchdogHandle {
    watchdog: Arc<MemoryWatchdog>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn watchdog(&self) -> &Arc<MemoryWatchdog> {
        &self.watchdog
    }

    /// Request the loop to exit without waiting for it.
    pub fn stop(&self) {
        self.watchdog.stop();
    }

    /// Whether the sampling thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the loop to exit. Blocks until someone calls `stop`.
    pub fn join(mut self) -> Result<(), WatchdogError> {
        self.join_thread()
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn stop_and_join(self) -> Result<(), WatchdogError> {
        self.stop();
        self.join()
    }

    fn join_thread(&mut self) -> Result<(), WatchdogError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| WatchdogError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.watchdog.stop();
        if let Err(e) = self.join_thread() {
            warn!(error = %e, "Memory watchdog thread did not exit cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::probe::FnProbe;
    use crate::report::CaptureSink;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const MB: u64 = 1024 * 1024;

    fn fast_config(critical_bytes: i64) -> WatchdogConfig {
        WatchdogConfig {
            critical_bytes,
            interval_millis: 1,
        }
    }

    fn counting_probe(bytes: u64) -> (Arc<AtomicUsize>, impl MemoryProbe) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let probe = FnProbe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(bytes)
        });
        (calls, probe)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_positive_threshold_is_stored() {
        for critical in [1, 1024, 52_428_800, i64::MAX] {
            let watchdog = MemoryWatchdog::new(critical).unwrap();
            assert_eq!(watchdog.critical_bytes(), critical as u64);
            assert_eq!(watchdog.interval(), Duration::from_secs(1));
            assert!(!watchdog.is_closed());
            assert!(!watchdog.is_stop_requested());
        }
    }

    #[test]
    fn test_non_positive_threshold_rejected() {
        for critical in [0, -1, i64::MIN] {
            let result = MemoryWatchdog::new(critical);
            assert!(matches!(result, Err(WatchdogError::InvalidArgument(v)) if v == critical));
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = WatchdogConfig {
            critical_bytes: 1,
            interval_millis: 0,
        };
        assert!(matches!(
            MemoryWatchdog::with_config(&config),
            Err(WatchdogError::Config(ConfigError::ZeroInterval))
        ));
    }

    #[test]
    fn test_warning_boundary() {
        let watchdog = MemoryWatchdog::new(100).unwrap();
        assert_eq!(watchdog.assess(49).count(), 1);
        assert_eq!(watchdog.assess(50).count(), 2);
        assert_eq!(watchdog.assess(500).count(), 2);

        // Odd threshold: half is 50.5
        let watchdog = MemoryWatchdog::new(101).unwrap();
        assert!(!watchdog.assess(50).any(|r| r.is_warning()));
        assert!(watchdog.assess(51).any(|r| r.is_warning()));

        let watchdog = MemoryWatchdog::new(i64::MAX).unwrap();
        assert!(watchdog.assess(u64::MAX).any(|r| r.is_warning()));
    }

    #[test]
    fn test_fifty_megabyte_ramp() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let probe = FnProbe::new(move || {
            let step = counter.fetch_add(1, Ordering::SeqCst) as u64;
            if step <= 10 {
                Ok(step * 5 * MB)
            } else {
                Err(ProbeError::Unavailable("ramp finished".into()))
            }
        });
        let sink = Arc::new(CaptureSink::new());

        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(52_428_800))
                .unwrap()
                .with_probe(probe)
                .with_sink(sink.clone()),
        );
        let handle = watchdog.spawn().unwrap();
        wait_until(|| steps.load(Ordering::SeqCst) > 12);
        handle.stop_and_join().unwrap();

        let mut expected = Vec::new();
        for step in 0..=10u64 {
            expected.push(format!("Memory used: {}.00 MB", step * 5));
            if step >= 5 {
                expected.push(format!("Warning: {}.00% of critical memory in use", step * 10));
            }
        }
        assert_eq!(sink.lines(), expected);

        let reports = sink.reports();
        let first_warning = reports.iter().position(Report::is_warning).unwrap();
        assert_eq!(reports[first_warning - 1], Report::Usage { used_bytes: 25 * MB });
    }

    #[test]
    fn test_stop_before_run_returns_immediately() {
        let (calls, probe) = counting_probe(MB);
        let watchdog = MemoryWatchdog::new(10 * MB as i64).unwrap().with_probe(probe);

        watchdog.stop();
        watchdog.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_stop_right_after_spawn() {
        let (calls, probe) = counting_probe(MB);
        let watchdog = Arc::new(
            MemoryWatchdog::new(10 * MB as i64)
                .unwrap()
                .with_probe(probe)
                .with_sink(CaptureSink::new()),
        );

        let handle = watchdog.spawn().unwrap();
        handle.stop();
        wait_until(|| handle.is_finished());
        handle.join().unwrap();

        assert!(calls.load(Ordering::SeqCst) <= 1);
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_repeated_stop_ends_loop_within_interval() {
        let (calls, probe) = counting_probe(MB);
        let watchdog = Arc::new(
            MemoryWatchdog::new(10 * MB as i64)
                .unwrap()
                .with_probe(probe)
                .with_sink(CaptureSink::new()),
        );

        let handle = watchdog.spawn().unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) >= 1);

        let stopped_at = Instant::now();
        watchdog.stop();
        watchdog.stop();
        watchdog.stop();
        handle.join().unwrap();

        // Default interval is one second; the wait is interrupted well before that.
        assert!(stopped_at.elapsed() < watchdog.interval());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let watchdog = MemoryWatchdog::new(1024).unwrap();

        assert!(watchdog.close());
        assert!(!watchdog.close());
        assert!(!watchdog.stop());

        assert!(watchdog.is_closed());
        assert!(watchdog.is_stop_requested());
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_closed_implies_stop_requested() {
        for _ in 0..200 {
            let watchdog = Arc::new(MemoryWatchdog::new(1024).unwrap());
            let observer = {
                let watchdog = watchdog.clone();
                thread::spawn(move || loop {
                    // Same order the loop relies on: closed first, then the signal.
                    if watchdog.is_closed() {
                        return watchdog.is_stop_requested();
                    }
                    std::hint::spin_loop();
                })
            };

            watchdog.close();
            assert!(observer.join().unwrap());
        }
    }

    #[test]
    fn test_concurrent_close_and_stop() {
        let (calls, probe) = counting_probe(MB);
        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(1024))
                .unwrap()
                .with_probe(probe)
                .with_sink(CaptureSink::new()),
        );

        let handle = watchdog.spawn().unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) >= 3);

        let closes = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let callers: Vec<_> = (0..8)
            .map(|i| {
                let watchdog = watchdog.clone();
                let closes = closes.clone();
                let stops = stops.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        if watchdog.close() {
                            closes.fetch_add(1, Ordering::SeqCst);
                        }
                    } else if watchdog.stop() {
                        stops.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        handle.join().unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(stops.load(Ordering::SeqCst) <= 1);
        assert!(watchdog.is_closed());
        assert!(!watchdog.is_running());
        assert!(!watchdog.stop());

        let after_join = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), after_join);
    }

    #[test]
    fn test_run_after_close_fails() {
        let (calls, probe) = counting_probe(MB);
        let watchdog = Arc::new(MemoryWatchdog::new(1024).unwrap().with_probe(probe));
        watchdog.close();

        assert!(matches!(watchdog.run(), Err(WatchdogError::ClosedResource)));
        assert!(matches!(watchdog.spawn(), Err(WatchdogError::ClosedResource)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_stops_running_loop() {
        let (calls, probe) = counting_probe(MB);
        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(1024))
                .unwrap()
                .with_probe(probe)
                .with_sink(CaptureSink::new()),
        );

        let handle = watchdog.spawn().unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) >= 3);
        watchdog.close();
        handle.join().unwrap();

        let after_join = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), after_join);
    }

    #[test]
    fn test_second_loop_rejected() {
        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(1024))
                .unwrap()
                .with_probe(counting_probe(MB).1)
                .with_sink(CaptureSink::new()),
        );

        let handle = watchdog.spawn().unwrap();
        assert!(matches!(watchdog.spawn(), Err(WatchdogError::AlreadyRunning)));
        assert!(matches!(watchdog.run(), Err(WatchdogError::AlreadyRunning)));
        handle.stop_and_join().unwrap();
    }

    #[test]
    fn test_dropping_handle_stops_and_joins() {
        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(1024))
                .unwrap()
                .with_probe(counting_probe(MB).1)
                .with_sink(CaptureSink::new()),
        );

        {
            let handle = watchdog.spawn().unwrap();
            assert!(Arc::ptr_eq(handle.watchdog(), &watchdog));
            wait_until(|| watchdog.is_running());
            assert!(!handle.is_finished());
        }

        assert!(watchdog.is_stop_requested());
        assert!(!watchdog.is_running());
        assert_eq!(Arc::strong_count(&watchdog), 1);
    }

    #[test]
    fn test_probe_failures_do_not_end_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let probe = FnProbe::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(ProbeError::Unavailable("flaky".into()))
            } else {
                Ok(MB)
            }
        });
        let sink = Arc::new(CaptureSink::new());
        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(1024))
                .unwrap()
                .with_probe(probe)
                .with_sink(sink.clone()),
        );

        let handle = watchdog.spawn().unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) >= 6);
        handle.stop_and_join().unwrap();

        assert!(sink.reports().iter().any(|r| *r == Report::Usage { used_bytes: MB }));
    }

    struct BrokenSink(AtomicUsize);

    impl ReportSink for BrokenSink {
        fn emit(&self, _report: &Report) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_sink_failures_do_not_end_loop() {
        let sink = Arc::new(BrokenSink(AtomicUsize::new(0)));
        let watchdog = Arc::new(
            MemoryWatchdog::with_config(&fast_config(1024))
                .unwrap()
                .with_probe(counting_probe(MB).1)
                .with_sink(sink.clone()),
        );

        let handle = watchdog.spawn().unwrap();
        wait_until(|| sink.0.load(Ordering::SeqCst) >= 6);
        handle.stop_and_join().unwrap();
    }

    #[test]
    fn test_drop_without_run() {
        let watchdog = MemoryWatchdog::new(1024).unwrap();
        drop(watchdog);
    }
}
