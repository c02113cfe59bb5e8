//! Fatal-failure escalation.
//!
//! The watchdog sweep does not decide what a timeout means for the system; it
//! hands the event to an [`Escalation`] collaborator.  [`PanicHandler`] is the
//! default one: it records the event, logs it at `error` level and lets the
//! system continue, leaving reset or recovery to whoever inspects
//! [`PanicHandler::last_info`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flake_types::{KernelError, KernelResult, MemoryKind, PanicReason};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use crate::clock::Clock;
use crate::memory::Allocator;

/// Longest message kept in a [`PanicInfo`].
const MAX_MESSAGE_LEN: usize = 63;

/// Receiver of fatal-failure events.
///
/// Implemented for any `Fn(PanicReason, &str)` closure, which keeps test
/// doubles short.
pub trait Escalation: Send + Sync {
    /// Report `reason` raised on behalf of `subsystem` (e.g. a watchdog name).
    fn escalate(&self, reason: PanicReason, subsystem: &str);
}

impl<F> Escalation for F
where
    F: Fn(PanicReason, &str) + Send + Sync,
{
    fn escalate(&self, reason: PanicReason, subsystem: &str) {
        self(reason, subsystem)
    }
}

/// Snapshot of the most recent panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanicInfo {
    pub reason: PanicReason,
    /// Kernel uptime when the panic was raised.
    pub uptime: Duration,
    pub timestamp: DateTime<Utc>,
    /// Name of the thread that raised it.
    pub task_name: String,
    pub message: String,
}

/// Records and logs fatal-failure events.
pub struct PanicHandler {
    clock: Arc<dyn Clock>,
    last: Mutex<Option<PanicInfo>>,
    count: AtomicU64,
}

impl PanicHandler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
            count: AtomicU64::new(0),
        }
    }

    /// Record a panic raised for `reason`.
    pub fn trigger(&self, reason: PanicReason, message: &str) {
        let task_name = std::thread::current()
            .name()
            .unwrap_or("unknown")
            .to_string();
        let message: String = message.chars().take(MAX_MESSAGE_LEN).collect();

        error!(reason = %reason, task = %task_name, message = %message, "PANIC");

        let info = PanicInfo {
            reason,
            uptime: self.clock.now(),
            timestamp: Utc::now(),
            task_name,
            message,
        };
        *self.last.lock() = Some(info);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// The most recent panic.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] when no panic has been recorded.
    pub fn last_info(&self) -> KernelResult<PanicInfo> {
        self.last
            .lock()
            .clone()
            .ok_or_else(|| KernelError::NotFound("no panic recorded".to_string()))
    }

    /// Number of panics recorded since boot.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Raise [`PanicReason::MemoryCorruption`] when the internal pool has
    /// fewer than `threshold` free bytes.  Returns whether it fired.
    pub fn check_memory(&self, allocator: &dyn Allocator, threshold: usize) -> bool {
        let stats = allocator.stats(MemoryKind::Internal);
        if stats.free < threshold {
            self.trigger(PanicReason::MemoryCorruption, "Low memory");
            return true;
        }
        false
    }
}

impl Escalation for PanicHandler {
    fn escalate(&self, reason: PanicReason, subsystem: &str) {
        self.trigger(reason, subsystem);
    }
}
