//! [`WatchdogRegistry`] – software liveness tokens.
//!
//! Any subsystem can register a token with its own timeout and must feed it
//! more often than that.  The orchestrator calls [`WatchdogRegistry::sweep`]
//! once per tick; every active token whose last feed is at least `timeout` in
//! the past is reported to the injected [`Escalation`] collaborator with
//! [`PanicReason::WatchdogTimeout`] and the token's name.
//!
//! A sweep does not deactivate or delete the tokens it escalates.  A starved
//! token is reported on every sweep until it is fed, paused or deleted.
//!
//! Feeding has two paths: [`WatchdogRegistry::feed`] looks the token up under
//! the registry lock, while a [`Feeder`] obtained once from
//! [`WatchdogRegistry::feeder`] stores the timestamp with a single atomic write
//! and never blocks.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flake_types::{
    KernelError, KernelResult, MemoryKind, PanicReason, WatchdogId, WatchdogKind, bounded_name,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::memory::{Allocation, Allocator};
use crate::panic::Escalation;
use crate::registry::{Arena, SweepOutcome, lock_bounded};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Read-only snapshot of a watchdog token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogInfo {
    pub id: WatchdogId,
    pub name: String,
    pub kind: WatchdogKind,
    pub timeout: Duration,
    /// Clock reading of the most recent feed.
    pub last_feed: Duration,
    pub active: bool,
}

/// Lock-free feed handle for one token.
///
/// Holds only a weak reference, so it does not keep a deleted token alive.
#[derive(Clone)]
pub struct Feeder {
    id: WatchdogId,
    last_feed: Weak<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl Feeder {
    pub fn id(&self) -> WatchdogId {
        self.id
    }

    /// Reset the token's timeout window.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] once the token has been deleted.
    pub fn feed(&self) -> KernelResult<()> {
        let slot = self.last_feed.upgrade().ok_or_else(|| not_found(self.id))?;
        slot.store(nanos(self.clock.now()), Ordering::Release);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal record
// ────────────────────────────────────────────────────────────────────────────

struct WatchdogRecord {
    name: String,
    kind: WatchdogKind,
    timeout: Duration,
    /// Clock reading of the last feed, in nanoseconds.
    last_feed_ns: Arc<AtomicU64>,
    active: bool,
    _lease: Allocation,
}

impl WatchdogRecord {
    fn last_feed(&self) -> Duration {
        Duration::from_nanos(self.last_feed_ns.load(Ordering::Acquire))
    }

    fn info(&self, id: u32) -> WatchdogInfo {
        WatchdogInfo {
            id: WatchdogId(id),
            name: self.name.clone(),
            kind: self.kind,
            timeout: self.timeout,
            last_feed: self.last_feed(),
            active: self.active,
        }
    }
}

struct Inner {
    tokens: Mutex<Arena<WatchdogRecord>>,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn Allocator>,
    escalation: Arc<dyn Escalation>,
}

// ────────────────────────────────────────────────────────────────────────────
// WatchdogRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Owns the set of watchdog tokens.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use flake_kernel::clock::ManualClock;
/// use flake_kernel::memory::BudgetAllocator;
/// use flake_kernel::watchdog::WatchdogRegistry;
/// use flake_types::{PanicReason, WatchdogKind};
///
/// let clock = Arc::new(ManualClock::new());
/// let escalate = |reason: PanicReason, name: &str| println!("{reason}: {name}");
/// let watchdogs = WatchdogRegistry::new(
///     clock.clone(),
///     Arc::new(BudgetAllocator::default()),
///     Arc::new(escalate),
/// );
///
/// let id = watchdogs
///     .create("perception", WatchdogKind::Task, Duration::from_secs(1))
///     .unwrap();
/// clock.advance(Duration::from_millis(600));
/// watchdogs.feed(id).unwrap();
/// clock.advance(Duration::from_millis(600));
///
/// assert_eq!(watchdogs.sweep(Duration::from_millis(10)).acted(), 0);
/// ```
#[derive(Clone)]
pub struct WatchdogRegistry {
    inner: Arc<Inner>,
}

impl WatchdogRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        allocator: Arc<dyn Allocator>,
        escalation: Arc<dyn Escalation>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokens: Mutex::new(Arena::new()),
                clock,
                allocator,
                escalation,
            }),
        }
    }

    /// Register an active token whose timeout window starts now.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for an empty name or a zero timeout.
    /// - [`KernelError::Memory`] when the record cannot be allocated.
    pub fn create(
        &self,
        name: &str,
        kind: WatchdogKind,
        timeout: Duration,
    ) -> KernelResult<WatchdogId> {
        if name.is_empty() {
            return Err(KernelError::InvalidParam(
                "watchdog name must not be empty".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(KernelError::InvalidParam(
                "watchdog timeout must be non-zero".to_string(),
            ));
        }
        let name = bounded_name(name);

        let id = {
            let mut tokens = self.inner.tokens.lock();
            let lease = self
                .inner
                .allocator
                .allocate(mem::size_of::<WatchdogRecord>(), MemoryKind::Internal)?;
            tokens.insert(WatchdogRecord {
                name: name.clone(),
                kind,
                timeout,
                last_feed_ns: Arc::new(AtomicU64::new(nanos(self.inner.clock.now()))),
                active: true,
                _lease: lease,
            })?
        };

        info!(watchdog = %name, id, kind = %kind, timeout_ms = millis(timeout), "watchdog created");
        Ok(WatchdogId(id))
    }

    /// Reset the token's timeout window to start now.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn feed(&self, id: WatchdogId) -> KernelResult<()> {
        let now = nanos(self.inner.clock.now());
        let tokens = self.inner.tokens.lock();
        let record = tokens.get(id.0).ok_or_else(|| not_found(id))?;
        record.last_feed_ns.store(now, Ordering::Release);
        Ok(())
    }

    /// Lock-free feed handle for the token.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn feeder(&self, id: WatchdogId) -> KernelResult<Feeder> {
        let tokens = self.inner.tokens.lock();
        let record = tokens.get(id.0).ok_or_else(|| not_found(id))?;
        Ok(Feeder {
            id,
            last_feed: Arc::downgrade(&record.last_feed_ns),
            clock: Arc::clone(&self.inner.clock),
        })
    }

    /// Remove the token.  Outstanding [`Feeder`]s start failing.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn delete(&self, id: WatchdogId) -> KernelResult<()> {
        let record = self
            .inner
            .tokens
            .lock()
            .remove(id.0)
            .ok_or_else(|| not_found(id))?;
        info!(watchdog = %record.name, id = id.0, "watchdog deleted");
        Ok(())
    }

    /// Pause or resume detection for the token.  Reactivating a paused token
    /// restarts its timeout window from now.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn set_active(&self, id: WatchdogId, active: bool) -> KernelResult<()> {
        let now = nanos(self.inner.clock.now());
        let mut tokens = self.inner.tokens.lock();
        let record = tokens.get_mut(id.0).ok_or_else(|| not_found(id))?;
        if active && !record.active {
            record.last_feed_ns.store(now, Ordering::Release);
        }
        record.active = active;
        debug!(watchdog = %record.name, active, "watchdog activity changed");
        Ok(())
    }

    /// Snapshot of one token.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn get(&self, id: WatchdogId) -> KernelResult<WatchdogInfo> {
        self.inner
            .tokens
            .lock()
            .get(id.0)
            .map(|record| record.info(id.0))
            .ok_or_else(|| not_found(id))
    }

    /// Snapshots of every token, in id order.
    pub fn list(&self) -> Vec<WatchdogInfo> {
        self.inner
            .tokens
            .lock()
            .iter()
            .map(|(id, record)| record.info(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Escalate every active token that has gone unfed for its timeout.
    ///
    /// Starved tokens are collected under the lock; escalation runs after the
    /// lock is released.  Returns [`SweepOutcome::Skipped`] without touching
    /// anything when the lock is not acquired within `bound`.
    pub fn sweep(&self, bound: Duration) -> SweepOutcome {
        let now = self.inner.clock.now();
        let (visited, starved) = {
            let Some(tokens) = lock_bounded(&self.inner.tokens, bound) else {
                debug!("watchdog table busy, sweep skipped");
                return SweepOutcome::Skipped;
            };
            let starved: Vec<(String, Duration, Duration)> = tokens
                .iter()
                .filter(|(_, record)| record.active)
                .filter_map(|(_, record)| {
                    let elapsed = now.saturating_sub(record.last_feed());
                    (elapsed >= record.timeout).then(|| {
                        (record.name.clone(), elapsed, record.timeout)
                    })
                })
                .collect();
            (tokens.len(), starved)
        };

        for (name, elapsed, timeout) in &starved {
            error!(
                watchdog = %name,
                elapsed_ms = millis(*elapsed),
                timeout_ms = millis(*timeout),
                "watchdog timeout"
            );
            self.inner
                .escalation
                .escalate(PanicReason::WatchdogTimeout, name);
        }

        SweepOutcome::Completed {
            visited,
            acted: starved.len(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn not_found(id: WatchdogId) -> KernelError {
    KernelError::NotFound(format!("watchdog {id}"))
}
