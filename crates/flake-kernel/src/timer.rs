//! [`TimerRegistry`] – one-shot and periodic callbacks driven by the
//! orchestrator.
//!
//! Timers are created inactive and armed with [`TimerRegistry::start`].
//! [`TimerRegistry::process`] fires every active timer whose deadline has
//! passed.  A periodic timer is rescheduled to `now + interval`, measured from
//! the sweep that fired it rather than from its previous deadline, so sweep
//! jitter makes its effective period drift longer than nominal.  A one-shot
//! timer is deactivated and can be re-armed with `start`.
//!
//! Callbacks run on the orchestrator's thread with the registry lock released.
//! They must not block: a slow callback delays every other timer and the
//! watchdog sweep of the same tick.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use flake_types::{KernelError, KernelResult, MemoryKind, TimerId};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::memory::{Allocation, Allocator};
use crate::registry::{Arena, SweepOutcome, lock_bounded};

/// Callback fired by a timer.  Captures whatever state it needs.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Read-only snapshot of a timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerInfo {
    pub id: TimerId,
    pub interval: Duration,
    /// Clock reading at or after which the timer fires next.
    pub next_trigger: Duration,
    pub periodic: bool,
    pub active: bool,
}

struct TimerRecord {
    interval: Duration,
    next_trigger: Duration,
    callback: TimerCallback,
    periodic: bool,
    active: bool,
    _lease: Allocation,
}

impl TimerRecord {
    fn info(&self, id: u32) -> TimerInfo {
        TimerInfo {
            id: TimerId(id),
            interval: self.interval,
            next_trigger: self.next_trigger,
            periodic: self.periodic,
            active: self.active,
        }
    }
}

struct Inner {
    timers: Mutex<Arena<TimerRecord>>,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn Allocator>,
}

/// Owns the set of scheduled callbacks.
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<Inner>,
}

impl TimerRegistry {
    pub fn new(clock: Arc<dyn Clock>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(Arena::new()),
                clock,
                allocator,
            }),
        }
    }

    /// Register an inactive timer.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for a zero interval, or one so large
    ///   the first deadline cannot be represented.
    /// - [`KernelError::Memory`] when the record cannot be allocated.
    pub fn create<F>(&self, interval: Duration, callback: F, periodic: bool) -> KernelResult<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(KernelError::InvalidParam(
                "timer interval must be non-zero".to_string(),
            ));
        }
        let next_trigger = deadline(self.inner.clock.now(), interval)?;

        let id = {
            let mut timers = self.inner.timers.lock();
            let lease = self
                .inner
                .allocator
                .allocate(mem::size_of::<TimerRecord>(), MemoryKind::Internal)?;
            timers.insert(TimerRecord {
                interval,
                next_trigger,
                callback: Arc::new(callback),
                periodic,
                active: false,
                _lease: lease,
            })?
        };

        info!(timer = id, interval_ms = interval.as_millis() as u64, periodic, "timer created");
        Ok(TimerId(id))
    }

    /// Arm the timer to fire `interval` from now.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] for an unknown id.
    /// - [`KernelError::InvalidParam`] when `now + interval` overflows; the
    ///   timer is left as it was.
    pub fn start(&self, id: TimerId) -> KernelResult<()> {
        let now = self.inner.clock.now();
        let mut timers = self.inner.timers.lock();
        let record = timers.get_mut(id.0).ok_or_else(|| not_found(id))?;
        record.next_trigger = deadline(now, record.interval)?;
        record.active = true;
        debug!(timer = id.0, "timer started");
        Ok(())
    }

    /// Disarm the timer without removing it.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn stop(&self, id: TimerId) -> KernelResult<()> {
        let mut timers = self.inner.timers.lock();
        let record = timers.get_mut(id.0).ok_or_else(|| not_found(id))?;
        record.active = false;
        debug!(timer = id.0, "timer stopped");
        Ok(())
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn delete(&self, id: TimerId) -> KernelResult<()> {
        self.inner
            .timers
            .lock()
            .remove(id.0)
            .ok_or_else(|| not_found(id))?;
        info!(timer = id.0, "timer deleted");
        Ok(())
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn get(&self, id: TimerId) -> KernelResult<TimerInfo> {
        self.inner
            .timers
            .lock()
            .get(id.0)
            .map(|record| record.info(id.0))
            .ok_or_else(|| not_found(id))
    }

    pub fn list(&self) -> Vec<TimerInfo> {
        self.inner
            .timers
            .lock()
            .iter()
            .map(|(id, record)| record.info(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every due timer.
    ///
    /// Due timers are rescheduled (or deactivated) under the lock; their
    /// callbacks then run in id order after the lock is released.  A panicking
    /// callback is logged and does not stop the others.
    pub fn process(&self, bound: Duration) -> SweepOutcome {
        let now = self.inner.clock.now();
        let (visited, due) = {
            let Some(mut timers) = lock_bounded(&self.inner.timers, bound) else {
                debug!("timer table busy, processing skipped");
                return SweepOutcome::Skipped;
            };
            let visited = timers.len();
            let mut due: Vec<(u32, TimerCallback)> = Vec::new();
            for (id, record) in timers.iter_mut() {
                if !record.active || record.next_trigger > now {
                    continue;
                }
                if record.periodic {
                    record.next_trigger = now.saturating_add(record.interval);
                } else {
                    record.active = false;
                }
                due.push((id, Arc::clone(&record.callback)));
            }
            (visited, due)
        };

        for (id, callback) in &due {
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(timer = id, "timer callback panicked");
            }
        }

        SweepOutcome::Completed {
            visited,
            acted: due.len(),
        }
    }
}

fn deadline(now: Duration, interval: Duration) -> KernelResult<Duration> {
    now.checked_add(interval).ok_or_else(|| {
        KernelError::InvalidParam(format!("timer deadline overflows ({interval:?} from now)"))
    })
}

fn not_found(id: TimerId) -> KernelError {
    KernelError::NotFound(format!("timer {id}"))
}
