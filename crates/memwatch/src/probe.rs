//! Memory sampling primitives.
//!
//! The watchdog only needs a point-in-time byte count. Two real sources are
//! provided:
//! - [`ProcessRss`]: resident set size of this process, read through `sysinfo`.
//! - [`AllocatorProbe`]: live heap bytes counted by a [`TrackingAllocator`]
//!   installed as the global allocator.
//!
//! [`FnProbe`] adapts a closure, which is how simulated usage is fed in.

use crate::error::ProbeError;
use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// A process-wide memory usage sampler.
pub trait MemoryProbe: Send + Sync {
    /// Current bytes in use.
    fn sample(&self) -> Result<u64, ProbeError>;
}

impl<T: MemoryProbe + ?Sized> MemoryProbe for Arc<T> {
    fn sample(&self) -> Result<u64, ProbeError> {
        (**self).sample()
    }
}

/// Samples the resident set size of the current process.
pub struct ProcessRss {
    system: Mutex<System>,
    pid: Pid,
}

impl ProcessRss {
    /// Create a probe for the calling process.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for ProcessRss {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessRss {
    fn sample(&self) -> Result<u64, ProbeError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        system
            .process(self.pid)
            .map(|p| p.memory())
            .ok_or(ProbeError::ProcessNotFound {
                pid: self.pid.as_u32(),
            })
    }
}

/// Live and peak byte counters maintained by a [`TrackingAllocator`].
#[derive(Debug, Default)]
pub struct AllocStats {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl AllocStats {
    /// Zeroed counters, usable in a `static`.
    pub const fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_alloc(&self, size: usize) {
        let live = self.live.fetch_add(size, Ordering::Relaxed) + size;

        let mut peak = self.peak.load(Ordering::Relaxed);
        while live > peak {
            match self.peak.compare_exchange_weak(
                peak,
                live,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    pub(crate) fn record_dealloc(&self, size: usize) {
        self.live.fetch_sub(size, Ordering::Relaxed);
    }

    /// Bytes currently allocated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Highest value `live` has reached.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Global allocator wrapper that counts live heap bytes.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator<mimalloc::MiMalloc> = TrackingAllocator::mimalloc();
/// ```
pub struct TrackingAllocator<A> {
    inner: A,
    stats: AllocStats,
}

impl<A> TrackingAllocator<A> {
    /// Wrap `inner`, counting every allocation that passes through.
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            stats: AllocStats::new(),
        }
    }

    /// The counters for this allocator.
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }
}

impl TrackingAllocator<mimalloc::MiMalloc> {
    /// Tracking wrapper around mimalloc.
    pub const fn mimalloc() -> Self {
        Self::new(mimalloc::MiMalloc)
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            self.stats.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            self.stats.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        self.stats.record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            self.stats.record_dealloc(layout.size());
            self.stats.record_alloc(new_size);
        }
        new_ptr
    }
}

/// Reads live bytes from a [`TrackingAllocator`]'s counters.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorProbe {
    stats: &'static AllocStats,
}

impl AllocatorProbe {
    pub fn new(stats: &'static AllocStats) -> Self {
        Self { stats }
    }

    /// Peak live bytes observed so far.
    pub fn peak(&self) -> u64 {
        self.stats.peak() as u64
    }
}

impl MemoryProbe for AllocatorProbe {
    fn sample(&self) -> Result<u64, ProbeError> {
        Ok(self.stats.live() as u64)
    }
}

/// Probe backed by a closure.
pub struct FnProbe<F>(F);

impl<F> FnProbe<F>
where
    F: Fn() -> Result<u64, ProbeError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> MemoryProbe for FnProbe<F>
where
    F: Fn() -> Result<u64, ProbeError> + Send + Sync,
{
    fn sample(&self) -> Result<u64, ProbeError> {
        (self.0)()
    }
}
