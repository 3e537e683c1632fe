//! Stage watchdog for detecting stalled handlers
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each node stores the start time of its current handler call in an atomic,
//! and the watchdog thread periodically scans these timestamps to detect
//! handlers that have been running longer than the stall threshold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Default time a handler may run before it is reported
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for one monitored operation
struct OperationState {
    /// Timestamp (ms since epoch) when current operation started, or 0 if idle
    last_op_start: AtomicU64,
    /// Track if we've already warned about this operation
    has_warned: AtomicBool,
    node_name: String,
    operation: String, // "handle", "produce", ...
}

/// Handle to one node's watchdog state (held by the node's handling loop)
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<OperationState>,
}

impl WatchdogHandle {
    /// Mark the start of a monitored operation
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.last_op_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the end of a monitored operation
    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!(
                "UNBLOCKED: [{}] {}",
                self.state.node_name, self.state.operation
            );
        }
        self.state.last_op_start.store(0, Ordering::Relaxed);
    }

    /// Whether the watchdog has flagged the current operation
    pub fn is_flagged(&self) -> bool {
        self.state.has_warned.load(Ordering::Relaxed)
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    operations: Arc<Mutex<Vec<Weak<OperationState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    /// Create a new watchdog with the default stall threshold
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_STALL_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            operations: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Register a new operation for monitoring
    pub fn register(&self, node_name: &str, operation: &str) -> WatchdogHandle {
        let state = Arc::new(OperationState {
            last_op_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            node_name: node_name.to_string(),
            operation: operation.to_string(),
        });

        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Check for operations running longer than the threshold
    pub fn check_for_stalls(&self) {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;

        let mut operations = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Remove dead weak references and check live ones
        operations.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.last_op_start.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                if duration_ms > threshold_ms && !state.has_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "STALLED: [{}] {} running for {:.1}s",
                        state.node_name,
                        state.operation,
                        duration_ms as f64 / 1000.0
                    );
                }
            }
            true
        });
    }

    /// Start the watchdog monitoring thread
    pub fn start_monitoring_thread(&self) -> JoinHandle<()> {
        let watchdog = self.clone();
        // Scan a few times per threshold, but never busier than every 10ms
        let interval = (self.threshold / 4).max(Duration::from_millis(10));
        thread::spawn(move || {
            while watchdog.enabled.load(Ordering::Relaxed) {
                thread::sleep(interval);
                watchdog.check_for_stalls();
            }
        })
    }

    /// Stop the watchdog monitoring thread
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking an operation
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}
