//! [`EventBus`] – named publish/subscribe notifications.
//!
//! [`EventBus::publish`] only queues the event; nothing is delivered until the
//! orchestrator calls [`EventBus::process`].  Each pass drains the pending
//! queue in publication order and calls every subscription whose event name
//! matches, on the orchestrator's thread and with no lock held.  Events
//! published by a callback are delivered on the next pass.
//!
//! The subscription set is snapshotted once per pass, so a subscription
//! removed by a callback may still receive the remaining events of that pass.

use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flake_types::{
    EventKind, KernelError, KernelResult, MemoryKind, Pid, SubscriptionId, bounded_name,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::memory::{Allocation, Allocator};
use crate::registry::{Arena, SweepOutcome, lock_bounded};
use crate::scheduler::ProcessRegistry;

/// Largest payload an event carries; longer payloads are truncated.
pub const MAX_EVENT_DATA: usize = 64;

/// Events that can wait for delivery before `publish` starts to block.
pub const MAX_PENDING_EVENTS: usize = 50;

/// How long `publish` waits for room in a full pending queue.
pub const PUBLISH_WAIT: Duration = Duration::from_millis(100);

/// Published when a process is created.
pub const PROCESS_CREATED: &str = "proc.created";
/// Published when a process is terminated.
pub const PROCESS_TERMINATED: &str = "proc.terminated";
/// Published by the kernel when a low-memory episode starts.
pub const MEMORY_LOW: &str = "mem.low";
/// Published on a fatal-failure escalation.
pub const SYSTEM_PANIC: &str = "sys.panic";

/// Callback run for every matching event.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// A published notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub name: String,
    pub kind: EventKind,
    /// Clock reading at publication.
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// Read-only snapshot of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub event: String,
    /// Process that subscribed, if it subscribed from one.
    pub subscriber: Option<Pid>,
}

struct SubscriptionRecord {
    event: String,
    callback: EventCallback,
    subscriber: Option<Pid>,
    _lease: Allocation,
}

struct Inner {
    subscriptions: Mutex<Arena<SubscriptionRecord>>,
    pending: Mutex<VecDeque<Event>>,
    drained: Condvar,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn Allocator>,
    processes: ProcessRegistry,
}

/// Owns the subscriptions and the queue of undelivered events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(
        clock: Arc<dyn Clock>,
        allocator: Arc<dyn Allocator>,
        processes: ProcessRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Arena::new()),
                pending: Mutex::new(VecDeque::with_capacity(MAX_PENDING_EVENTS)),
                drained: Condvar::new(),
                clock,
                allocator,
                processes,
            }),
        }
    }

    /// Queue an event for the next [`EventBus::process`] pass.  The name is
    /// bounded like every other kernel name; the payload is truncated to
    /// [`MAX_EVENT_DATA`] bytes.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for an empty name.
    /// - [`KernelError::Timeout`] when the pending queue stays full for
    ///   [`PUBLISH_WAIT`].
    pub fn publish(&self, name: &str, kind: EventKind, data: &[u8]) -> KernelResult<()> {
        if name.is_empty() {
            return Err(KernelError::InvalidParam(
                "event name must not be empty".to_string(),
            ));
        }
        let event = Event {
            name: bounded_name(name),
            kind,
            timestamp: self.inner.clock.now(),
            data: data[..data.len().min(MAX_EVENT_DATA)].to_vec(),
        };

        let deadline = Instant::now() + PUBLISH_WAIT;
        let mut pending = self.inner.pending.lock();
        while pending.len() >= MAX_PENDING_EVENTS {
            if Instant::now() >= deadline {
                warn!(event = %event.name, "event queue full, event dropped");
                return Err(KernelError::Timeout(format!(
                    "event queue full, '{}' not published",
                    event.name
                )));
            }
            self.inner.drained.wait_until(&mut pending, deadline);
        }
        debug!(event = %event.name, kind = %event.kind, "event published");
        pending.push_back(event);
        Ok(())
    }

    /// Register `callback` for events named `event`, owned by the calling
    /// process.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for an empty event name.
    /// - [`KernelError::Memory`] when the record cannot be allocated.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> KernelResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if event.is_empty() {
            return Err(KernelError::InvalidParam(
                "event name must not be empty".to_string(),
            ));
        }
        let event = bounded_name(event);
        let subscriber = self.inner.processes.get_current().map(|p| p.pid);

        let id = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let lease = self
                .inner
                .allocator
                .allocate(mem::size_of::<SubscriptionRecord>(), MemoryKind::Internal)?;
            subscriptions.insert(SubscriptionRecord {
                event: event.clone(),
                callback: Arc::new(callback),
                subscriber,
                _lease: lease,
            })?
        };

        info!(event = %event, subscription = id, "subscribed");
        Ok(SubscriptionId(id))
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> KernelResult<()> {
        let record = self
            .inner
            .subscriptions
            .lock()
            .remove(id.0)
            .ok_or_else(|| KernelError::NotFound(format!("subscription {id}")))?;
        info!(event = %record.event, subscription = id.0, "unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .map(|(id, record)| SubscriptionInfo {
                id: SubscriptionId(id),
                event: record.event.clone(),
                subscriber: record.subscriber,
            })
            .collect()
    }

    /// Events waiting for the next pass.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Deliver every pending event.  `visited` counts events, `acted` counts
    /// callback invocations.  When the subscription table is contended the
    /// pass is skipped and the events stay queued.
    pub fn process(&self, bound: Duration) -> SweepOutcome {
        let (events, routes) = {
            let Some(subscriptions) = lock_bounded(&self.inner.subscriptions, bound) else {
                debug!("subscription table busy, event delivery skipped");
                return SweepOutcome::Skipped;
            };
            let events: Vec<Event> = self.inner.pending.lock().drain(..).collect();
            let routes: Vec<(String, EventCallback)> = subscriptions
                .iter()
                .map(|(_, record)| (record.event.clone(), Arc::clone(&record.callback)))
                .collect();
            (events, routes)
        };
        if !events.is_empty() {
            self.inner.drained.notify_all();
        }

        let mut delivered = 0;
        for event in &events {
            let mut count = 0;
            for (_, callback) in routes.iter().filter(|(name, _)| *name == event.name) {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    error!(event = %event.name, "event callback panicked");
                }
                count += 1;
            }
            debug!(event = %event.name, subscribers = count, "event delivered");
            delivered += count;
        }

        SweepOutcome::Completed {
            visited: events.len(),
            acted: delivered,
        }
    }
}
