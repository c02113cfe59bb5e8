//! [`MessageQueueRegistry`] – named, bounded FIFO mailboxes between processes.
//!
//! A queue is created with a fixed capacity and is looked up by id or by
//! name.  [`MessageQueueRegistry::send`] and [`MessageQueueRegistry::receive`]
//! block the caller for at most the given timeout (`Duration::ZERO` polls,
//! `Duration::MAX` waits forever); the registry lock is only held to resolve
//! the queue, never while waiting.  Waits are measured in real time, not on
//! the kernel [`Clock`].
//!
//! Every message is stamped with a registry-wide [`MessageId`] and the clock
//! reading at send time.  A message sent from a managed thread without an
//! explicit sender carries the calling process's pid.
//!
//! Destroying a queue drops its pending messages and wakes every blocked
//! sender and receiver with [`KernelError::NotFound`].
//!
//! The orchestrator calls [`MessageQueueRegistry::process`] every tick; at most
//! once per [`MAINTENANCE_INTERVAL`] it walks the queues, warns about the
//! ones that are more than 90% full and logs aggregate statistics.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use flake_types::{
    KernelError, KernelResult, MemoryKind, MessageId, MessageKind, MessagePriority, Pid, QueueId,
    bounded_name,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::memory::{Allocation, Allocator};
use crate::registry::{Arena, SweepOutcome, lock_bounded};
use crate::scheduler::ProcessRegistry;

/// Largest payload a message carries; longer payloads are truncated.
pub const MAX_MESSAGE_SIZE: usize = 256;

/// Minimum spacing between two maintenance passes of
/// [`MessageQueueRegistry::process`].
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// A unit of data exchanged through a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Filled with the current process on send when left empty.
    pub sender: Option<Pid>,
    pub receiver: Option<Pid>,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    /// Assigned by the registry on send.
    pub id: MessageId,
    /// Clock reading at send time.
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

impl Message {
    /// Build a normal-priority message.  The payload is truncated to
    /// [`MAX_MESSAGE_SIZE`] bytes.
    pub fn new(kind: MessageKind, data: impl Into<Vec<u8>>) -> Self {
        let mut data = data.into();
        data.truncate(MAX_MESSAGE_SIZE);
        Self {
            sender: None,
            receiver: None,
            kind,
            priority: MessagePriority::Normal,
            id: MessageId(0),
            timestamp: Duration::ZERO,
            data,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn to(mut self, receiver: Pid) -> Self {
        self.receiver = Some(receiver);
        self
    }
}

/// Read-only snapshot of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub id: QueueId,
    pub name: String,
    pub capacity: usize,
    /// Messages waiting to be received.
    pub pending: usize,
    /// Public queues receive broadcasts.
    pub public: bool,
    /// Process that created the queue, if it was created from one.
    pub owner: Option<Pid>,
}

// ────────────────────────────────────────────────────────────────────────────
// Channel
// ────────────────────────────────────────────────────────────────────────────

struct Slots {
    messages: VecDeque<Message>,
    closed: bool,
}

/// The bounded buffer behind one queue.  Locked on its own, after the
/// registry lock has been released.
struct Channel {
    name: String,
    capacity: usize,
    slots: Mutex<Slots>,
    readable: Condvar,
    writable: Condvar,
}

impl Channel {
    fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            slots: Mutex::new(Slots {
                messages: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    fn push(&self, message: Message, timeout: Duration) -> KernelResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slots = self.slots.lock();
        loop {
            if slots.closed {
                return Err(self.destroyed());
            }
            if slots.messages.len() < self.capacity {
                slots.messages.push_back(message);
                drop(slots);
                self.readable.notify_one();
                return Ok(());
            }
            match deadline {
                Some(at) if Instant::now() >= at => {
                    return Err(KernelError::Timeout(format!(
                        "message queue '{}' is full",
                        self.name
                    )));
                }
                Some(at) => {
                    self.writable.wait_until(&mut slots, at);
                }
                None => self.writable.wait(&mut slots),
            }
        }
    }

    fn pop(&self, timeout: Duration) -> KernelResult<Message> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slots = self.slots.lock();
        loop {
            if slots.closed {
                return Err(self.destroyed());
            }
            if let Some(message) = slots.messages.pop_front() {
                drop(slots);
                self.writable.notify_one();
                return Ok(message);
            }
            match deadline {
                Some(at) if Instant::now() >= at => {
                    return Err(KernelError::Timeout(format!(
                        "message queue '{}' is empty",
                        self.name
                    )));
                }
                Some(at) => {
                    self.readable.wait_until(&mut slots, at);
                }
                None => self.readable.wait(&mut slots),
            }
        }
    }

    fn close(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.messages.clear();
        drop(slots);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn pending(&self) -> usize {
        self.slots.lock().messages.len()
    }

    fn destroyed(&self) -> KernelError {
        KernelError::NotFound(format!("message queue '{}' was destroyed", self.name))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal record
// ────────────────────────────────────────────────────────────────────────────

struct QueueRecord {
    owner: Option<Pid>,
    public: bool,
    channel: Arc<Channel>,
    _lease: Allocation,
}

impl QueueRecord {
    fn info(&self, id: u32) -> QueueInfo {
        QueueInfo {
            id: QueueId(id),
            name: self.channel.name.clone(),
            capacity: self.channel.capacity,
            pending: self.channel.pending(),
            public: self.public,
            owner: self.owner,
        }
    }
}

struct Inner {
    queues: Mutex<Arena<QueueRecord>>,
    next_message: AtomicU32,
    last_maintenance: Mutex<Duration>,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn Allocator>,
    processes: ProcessRegistry,
}

// ────────────────────────────────────────────────────────────────────────────
// MessageQueueRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Owns the set of message queues.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use flake_kernel::clock::ManualClock;
/// use flake_kernel::ipc::{Message, MessageQueueRegistry};
/// use flake_kernel::memory::BudgetAllocator;
/// use flake_kernel::scheduler::ProcessRegistry;
/// use flake_kernel::substrate::ThreadSubstrate;
/// use flake_types::MessageKind;
///
/// let allocator = Arc::new(BudgetAllocator::default());
/// let processes = ProcessRegistry::new(Arc::new(ThreadSubstrate::new()), allocator.clone());
/// let queues = MessageQueueRegistry::new(Arc::new(ManualClock::new()), allocator, processes);
///
/// let id = queues.create("telemetry", 8, true).unwrap();
/// queues
///     .send(id, Message::new(MessageKind::Data, *b"42"), Duration::ZERO)
///     .unwrap();
/// let received = queues.receive(id, Duration::ZERO).unwrap();
/// assert_eq!(received.data, b"42");
/// ```
#[derive(Clone)]
pub struct MessageQueueRegistry {
    inner: Arc<Inner>,
}

impl MessageQueueRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        allocator: Arc<dyn Allocator>,
        processes: ProcessRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(Arena::new()),
                next_message: AtomicU32::new(1),
                last_maintenance: Mutex::new(Duration::ZERO),
                clock,
                allocator,
                processes,
            }),
        }
    }

    /// Create an empty queue owned by the calling process.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for an empty name or a zero capacity.
    /// - [`KernelError::Conflict`] when a queue with the same name exists.
    /// - [`KernelError::Memory`] when the queue storage cannot be allocated.
    pub fn create(&self, name: &str, capacity: usize, public: bool) -> KernelResult<QueueId> {
        if name.is_empty() {
            return Err(KernelError::InvalidParam(
                "message queue name must not be empty".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(KernelError::InvalidParam(
                "message queue capacity must be non-zero".to_string(),
            ));
        }
        let name = bounded_name(name);
        let owner = self.current_pid();

        let id = {
            let mut queues = self.inner.queues.lock();
            if queues.iter().any(|(_, record)| record.channel.name == name) {
                return Err(KernelError::Conflict(format!(
                    "message queue '{name}' already exists"
                )));
            }
            let storage = capacity.saturating_mul(MAX_MESSAGE_SIZE);
            let lease = self.inner.allocator.allocate(
                mem::size_of::<QueueRecord>().saturating_add(storage),
                MemoryKind::Internal,
            )?;
            queues.insert(QueueRecord {
                owner,
                public,
                channel: Arc::new(Channel::new(name.clone(), capacity)),
                _lease: lease,
            })?
        };

        info!(queue = %name, id, capacity, public, "message queue created");
        Ok(QueueId(id))
    }

    /// Stamp `message` and append it to the queue, waiting up to `timeout`
    /// for room.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] for an unknown id, or when the queue is
    ///   destroyed while waiting.
    /// - [`KernelError::Timeout`] when the queue stays full for `timeout`.
    pub fn send(
        &self,
        id: QueueId,
        mut message: Message,
        timeout: Duration,
    ) -> KernelResult<MessageId> {
        let channel = self.channel(id)?;
        if message.sender.is_none() {
            message.sender = self.current_pid();
        }
        message.id = self.next_message_id();
        message.timestamp = self.inner.clock.now();

        let message_id = message.id;
        channel.push(message, timeout)?;
        debug!(queue = %channel.name, message = %message_id, "message sent");
        Ok(message_id)
    }

    /// Take the oldest message, waiting up to `timeout` for one to arrive.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] for an unknown id, or when the queue is
    ///   destroyed while waiting.
    /// - [`KernelError::Timeout`] when the queue stays empty for `timeout`.
    pub fn receive(&self, id: QueueId, timeout: Duration) -> KernelResult<Message> {
        let channel = self.channel(id)?;
        let message = channel.pop(timeout)?;
        debug!(queue = %channel.name, message = %message.id, "message received");
        Ok(message)
    }

    /// Deliver a copy of `message`, re-tagged as [`MessageKind::Broadcast`],
    /// to every public queue.  Full queues are skipped.  Returns how many
    /// queues received it.
    pub fn broadcast(&self, mut message: Message) -> usize {
        if message.sender.is_none() {
            message.sender = self.current_pid();
        }
        message.kind = MessageKind::Broadcast;
        message.id = self.next_message_id();
        message.timestamp = self.inner.clock.now();

        let targets: Vec<Arc<Channel>> = self
            .inner
            .queues
            .lock()
            .iter()
            .filter(|(_, record)| record.public)
            .map(|(_, record)| Arc::clone(&record.channel))
            .collect();

        let mut delivered = 0;
        for channel in &targets {
            match channel.push(message.clone(), Duration::ZERO) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(queue = %channel.name, error = %e, "broadcast not delivered"),
            }
        }
        info!(message = %message.id, delivered, "broadcast sent");
        delivered
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] when no queue has that name.
    pub fn find(&self, name: &str) -> KernelResult<QueueId> {
        let name = bounded_name(name);
        self.inner
            .queues
            .lock()
            .iter()
            .find(|(_, record)| record.channel.name == name)
            .map(|(id, _)| QueueId(id))
            .ok_or_else(|| KernelError::NotFound(format!("message queue '{name}'")))
    }

    /// Remove the queue, dropping its pending messages.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn destroy(&self, id: QueueId) -> KernelResult<()> {
        let record = self
            .inner
            .queues
            .lock()
            .remove(id.0)
            .ok_or_else(|| not_found(id))?;
        record.channel.close();
        info!(queue = %record.channel.name, id = id.0, "message queue destroyed");
        Ok(())
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn get(&self, id: QueueId) -> KernelResult<QueueInfo> {
        self.inner
            .queues
            .lock()
            .get(id.0)
            .map(|record| record.info(id.0))
            .ok_or_else(|| not_found(id))
    }

    pub fn list(&self) -> Vec<QueueInfo> {
        self.inner
            .queues
            .lock()
            .iter()
            .map(|(id, record)| record.info(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic maintenance.  Returns a completed pass with nothing visited
    /// until [`MAINTENANCE_INTERVAL`] has elapsed since the previous pass;
    /// `acted` counts queues that are more than 90% full.
    pub fn process(&self, bound: Duration) -> SweepOutcome {
        let now = self.inner.clock.now();
        if now.saturating_sub(*self.inner.last_maintenance.lock()) < MAINTENANCE_INTERVAL {
            return SweepOutcome::Completed {
                visited: 0,
                acted: 0,
            };
        }
        let Some(queues) = lock_bounded(&self.inner.queues, bound) else {
            debug!("message queue table busy, maintenance skipped");
            return SweepOutcome::Skipped;
        };
        *self.inner.last_maintenance.lock() = now;

        let (mut messages, mut empty, mut crowded) = (0, 0, 0);
        for (_, record) in queues.iter() {
            let channel = &record.channel;
            let pending = channel.pending();
            messages += pending;
            if pending == 0 {
                empty += 1;
            }
            if pending * 10 > channel.capacity * 9 {
                warn!(
                    queue = %channel.name,
                    pending,
                    capacity = channel.capacity,
                    "message queue nearly full"
                );
                crowded += 1;
            }
        }
        debug!(queues = queues.len(), messages, empty, "message queue stats");

        SweepOutcome::Completed {
            visited: queues.len(),
            acted: crowded,
        }
    }

    fn channel(&self, id: QueueId) -> KernelResult<Arc<Channel>> {
        self.inner
            .queues
            .lock()
            .get(id.0)
            .map(|record| Arc::clone(&record.channel))
            .ok_or_else(|| not_found(id))
    }

    fn current_pid(&self) -> Option<Pid> {
        self.inner.processes.get_current().map(|p| p.pid)
    }

    fn next_message_id(&self) -> MessageId {
        MessageId(self.inner.next_message.fetch_add(1, Ordering::Relaxed))
    }
}

fn not_found(id: QueueId) -> KernelError {
    KernelError::NotFound(format!("message queue {id}"))
}
