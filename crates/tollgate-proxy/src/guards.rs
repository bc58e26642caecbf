//! Resource guards: size ceilings, timeouts and the memory watchdog.
//!
//! ## Memory watchdog
//!
//! ```text
//! interval tick → sample process RSS (sysinfo) → above MAX_MEMORY_MB? → warn
//! ```
//!
//! The watchdog only logs. It runs independently of connections and never
//! throttles or closes anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::broadcast;

const MIB: u64 = 1024 * 1024;

/// Default hard ceiling on a request body.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 50 * MIB;
/// Default ceiling on a body sent to the inspector.
pub const DEFAULT_MAX_INSPECTION_BYTES: u64 = 15 * MIB;
/// Default inspection timeout.
pub const DEFAULT_INSPECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Default idle timeout for tunnels and TLS sockets.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default memory warning threshold in MiB.
pub const DEFAULT_MAX_MEMORY_MB: u64 = 1024;
/// Default memory sampling interval.
pub const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Size and time limits applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Bodies above this are drained and answered with 413.
    pub max_body_bytes: u64,
    /// Bodies above this are never sent to the inspector; multipart bodies
    /// above it are streamed.
    pub max_inspection_bytes: u64,
    pub inspection_timeout: Duration,
    /// Forward when inspection fails instead of answering 503.
    pub fail_open: bool,
    pub idle_timeout: Duration,
    pub upstream_connect_timeout: Duration,
    /// Time allowed for the upstream to produce response headers.
    pub upstream_response_timeout: Duration,
    pub max_memory_mb: u64,
    pub memory_check_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_inspection_bytes: DEFAULT_MAX_INSPECTION_BYTES,
            inspection_timeout: DEFAULT_INSPECTION_TIMEOUT,
            fail_open: true,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            upstream_connect_timeout: Duration::from_secs(10),
            upstream_response_timeout: Duration::from_secs(120),
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            memory_check_interval: DEFAULT_MEMORY_CHECK_INTERVAL,
        }
    }
}

impl Limits {
    /// Whether a body of `len` bytes may be sent to the inspector.
    pub fn inspectable(&self, len: usize) -> bool {
        len as u64 <= self.max_inspection_bytes
    }
}

/// Periodic process memory sampler.
#[derive(Clone)]
pub struct MemoryWatchdog {
    threshold_mb: u64,
    interval: Duration,
    /// Last sampled resident set size in bytes.
    last_rss: Arc<AtomicU64>,
    system: Arc<Mutex<System>>,
}

impl std::fmt::Debug for MemoryWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWatchdog")
            .field("threshold_mb", &self.threshold_mb)
            .field("interval", &self.interval)
            .field("last_rss", &self.last_rss.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryWatchdog {
    /// Creates a watchdog from the configured limits.
    pub fn new(limits: &Limits) -> Self {
        Self {
            threshold_mb: limits.max_memory_mb,
            interval: limits.memory_check_interval,
            last_rss: Arc::new(AtomicU64::new(0)),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Last sampled RSS in bytes (0 before the first sample).
    pub fn last_rss_bytes(&self) -> u64 {
        self.last_rss.load(Ordering::Relaxed)
    }

    /// Samples the current process RSS in bytes.
    pub fn sample(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let rss = system.process(pid)?.memory();
        self.last_rss.store(rss, Ordering::Relaxed);
        Some(rss)
    }

    /// Samples once and warns above the threshold. Returns true on a warning.
    pub fn check(&self) -> bool {
        let Some(rss) = self.sample() else {
            tracing::debug!("Process memory sample unavailable");
            return false;
        };

        let rss_mb = rss / MIB;
        if rss_mb > self.threshold_mb {
            tracing::warn!(
                rss_mb,
                threshold_mb = self.threshold_mb,
                "Process memory above threshold"
            );
            true
        } else {
            tracing::trace!(rss_mb, "Memory sample");
            false
        }
    }

    /// Runs the watchdog until a shutdown signal arrives.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let watchdog = self.clone();
                        // sysinfo reads /proc synchronously.
                        let _ = tokio::task::spawn_blocking(move || watchdog.check()).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("Memory watchdog stopped");
        })
    }
}
