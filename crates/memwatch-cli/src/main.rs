//! memwatch: reference workload for the memory watchdog
//!
//! Starts the watchdog with a 50 MB critical threshold, grows the heap by
//! 10 MB per second for ten seconds, then stops and joins the watchdog.

use anyhow::Result;
use memwatch::{AllocatorProbe, MemoryWatchdog, TrackingAllocator, WatchdogConfig};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// mimalloc underneath, with live-byte accounting for the watchdog
#[global_allocator]
static GLOBAL: TrackingAllocator<mimalloc::MiMalloc> = TrackingAllocator::mimalloc();

const CHUNK_BYTES: usize = 10 * 1024 * 1024;
const CHUNKS: usize = 10;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = WatchdogConfig::default();
    let watchdog = Arc::new(
        MemoryWatchdog::with_config(&config)?.with_probe(AllocatorProbe::new(GLOBAL.stats())),
    );

    let handle = watchdog.spawn()?;

    let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(CHUNKS);
    for _ in 0..CHUNKS {
        buffers.push(vec![0u8; CHUNK_BYTES]);
        thread::sleep(Duration::from_secs(1));
    }

    handle.stop_and_join()?;
    watchdog.close();

    info!(
        buffers = buffers.len(),
        peak_bytes = GLOBAL.stats().peak(),
        "Workload finished"
    );
    Ok(())
}
