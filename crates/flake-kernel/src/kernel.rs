//! [`Kernel`] – the tick orchestrator.
//!
//! The kernel owns the registries and drives them from one dedicated thread.
//! Each tick:
//!
//! 1. charges CPU time to `RUNNING` processes,
//! 2. sweeps the watchdog registry,
//! 3. fires due timers,
//! 4. runs message queue maintenance,
//! 5. delivers pending events,
//! 6. checks the internal memory pool against the low-memory threshold,
//!
//! then sleeps for the rest of the tick period.  Every sweep acquires its
//! registry lock with a bounded wait and skips the cycle when it is
//! contended, so a stuck mutator can delay detection by a tick but never
//! stall the orchestrator.
//!
//! The resource registry has no per-tick work; whoever terminates a process
//! calls [`ResourceRegistry::cleanup_for_process`] for it.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use flake_kernel::{Kernel, KernelConfig, KernelParts};
//! use flake_kernel::clock::ManualClock;
//! use flake_kernel::memory::BudgetAllocator;
//! use flake_kernel::substrate::ThreadSubstrate;
//! use flake_types::WatchdogKind;
//!
//! let clock = Arc::new(ManualClock::new());
//! let kernel = Kernel::with_parts(
//!     KernelConfig::default(),
//!     KernelParts {
//!         clock: clock.clone(),
//!         substrate: Arc::new(ThreadSubstrate::new()),
//!         allocator: Arc::new(BudgetAllocator::default()),
//!         escalation: None,
//!     },
//! )
//! .unwrap();
//!
//! kernel
//!     .watchdogs()
//!     .create("Worker-hb", WatchdogKind::Task, Duration::from_secs(1))
//!     .unwrap();
//! clock.advance(Duration::from_millis(1100));
//!
//! let report = kernel.tick();
//! assert_eq!(report.watchdogs.acted(), 1);
//! assert_eq!(kernel.panic_handler().count(), 1);
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flake_types::{EventKind, KernelError, KernelResult, MemoryKind, Priority};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::event::{self, EventBus};
use crate::ipc::MessageQueueRegistry;
use crate::memory::{Allocator, BudgetAllocator, MemoryBudgets};
use crate::panic::{Escalation, PanicHandler};
use crate::registry::{DEFAULT_SWEEP_BOUND, SweepOutcome};
use crate::resource::ResourceRegistry;
use crate::scheduler::ProcessRegistry;
use crate::substrate::{Substrate, ThreadSubstrate};
use crate::timer::TimerRegistry;
use crate::watchdog::WatchdogRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tunables of the orchestrator and the default allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Period of the orchestrator loop.
    pub tick_period_ms: u64,
    /// How long each sweep waits for its registry lock.
    pub sweep_lock_bound_ms: u64,
    /// Stack size of the orchestrator thread.
    pub kernel_stack_size: usize,
    pub kernel_priority: Priority,
    /// Free bytes in the internal pool below which a low-memory panic fires.
    pub low_memory_threshold: usize,
    pub memory: MemoryBudgets,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 50,
            sweep_lock_bound_ms: DEFAULT_SWEEP_BOUND.as_millis() as u64,
            kernel_stack_size: 64 * 1024,
            kernel_priority: Priority::Critical,
            low_memory_threshold: 1024,
            memory: MemoryBudgets::default(),
        }
    }
}

impl KernelConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn sweep_bound(&self) -> Duration {
        Duration::from_millis(self.sweep_lock_bound_ms)
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidParam`] for a zero tick period, a sweep bound that
    /// does not fit in one tick, or a zero kernel stack.
    pub fn validate(&self) -> KernelResult<()> {
        if self.tick_period_ms == 0 {
            return Err(KernelError::InvalidParam(
                "tick_period_ms must be non-zero".to_string(),
            ));
        }
        if self.sweep_lock_bound_ms >= self.tick_period_ms {
            return Err(KernelError::InvalidParam(format!(
                "sweep_lock_bound_ms ({}) must be shorter than tick_period_ms ({})",
                self.sweep_lock_bound_ms, self.tick_period_ms
            )));
        }
        if self.kernel_stack_size == 0 {
            return Err(KernelError::InvalidParam(
                "kernel_stack_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of the orchestrator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    Initializing,
    Running,
    Stopped,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelState::Initializing => "initializing",
            KernelState::Running => "running",
            KernelState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Collaborators injected into [`Kernel::with_parts`].
pub struct KernelParts {
    pub clock: Arc<dyn Clock>,
    pub substrate: Arc<dyn Substrate>,
    pub allocator: Arc<dyn Allocator>,
    /// Receiver of watchdog timeouts.  `None` routes them to the kernel's
    /// [`PanicHandler`].
    pub escalation: Option<Arc<dyn Escalation>>,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Sequence number of this tick, starting at 1.
    pub tick: u64,
    pub accounting: SweepOutcome,
    pub watchdogs: SweepOutcome,
    pub timers: SweepOutcome,
    pub messages: SweepOutcome,
    pub events: SweepOutcome,
    /// The internal pool is below the low-memory threshold.
    pub low_memory: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Kernel
// ────────────────────────────────────────────────────────────────────────────

struct KernelCore {
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn Allocator>,
    processes: ProcessRegistry,
    watchdogs: WatchdogRegistry,
    timers: TimerRegistry,
    queues: MessageQueueRegistry,
    events: EventBus,
    resources: ResourceRegistry,
    panic: Arc<PanicHandler>,
    state: Mutex<KernelState>,
    ticks: AtomicU64,
    low_memory: AtomicBool,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl KernelCore {
    fn tick(&self) -> TickReport {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let bound = self.config.sweep_bound();

        let accounting = self.processes.account_tick(bound);
        let watchdogs = self.watchdogs.sweep(bound);
        let timers = self.timers.process(bound);
        let messages = self.queues.process(bound);
        let events = self.events.process(bound);
        let low_memory = self.check_memory();

        if [accounting, watchdogs, timers, messages, events]
            .iter()
            .any(SweepOutcome::is_skipped)
        {
            debug!(tick, "tick completed with skipped sweeps");
        }
        TickReport {
            tick,
            accounting,
            watchdogs,
            timers,
            messages,
            events,
            low_memory,
        }
    }

    /// Fires once per low-memory episode rather than on every tick.  The
    /// start of an episode is also published as [`event::MEMORY_LOW`], for
    /// delivery on the next tick.
    fn check_memory(&self) -> bool {
        let threshold = self.config.low_memory_threshold;
        let low = if self.low_memory.load(Ordering::SeqCst) {
            self.allocator.stats(MemoryKind::Internal).free < threshold
        } else {
            let low = self.panic.check_memory(self.allocator.as_ref(), threshold);
            if low {
                let free = self.allocator.stats(MemoryKind::Internal).free as u64;
                if let Err(e) =
                    self.events
                        .publish(event::MEMORY_LOW, EventKind::System, &free.to_le_bytes())
                {
                    warn!(error = %e, "failed to publish low-memory event");
                }
            }
            low
        };
        self.low_memory.store(low, Ordering::SeqCst);
        low
    }

    fn run(&self) {
        let period = self.config.tick_period();
        info!(period_ms = self.config.tick_period_ms, "kernel loop started");
        loop {
            let deadline = Instant::now() + period;
            self.tick();

            let mut stop = self.stop.lock();
            while !*stop && Instant::now() < deadline {
                self.wake.wait_until(&mut stop, deadline);
            }
            if *stop {
                break;
            }
        }
        info!(ticks = self.ticks.load(Ordering::SeqCst), "kernel loop stopped");
    }
}

/// The kernel control plane: registries plus the tick orchestrator.
pub struct Kernel {
    core: Arc<KernelCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    /// Build a kernel over the hosted collaborators: [`SystemClock`],
    /// [`ThreadSubstrate`], a [`BudgetAllocator`] sized from
    /// `config.memory`, and its own [`PanicHandler`] as escalation target.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidParam`] when `config` fails validation.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let allocator = BudgetAllocator::new(config.memory);
        Self::with_parts(
            config,
            KernelParts {
                clock: Arc::new(SystemClock::new()),
                substrate: Arc::new(ThreadSubstrate::new()),
                allocator: Arc::new(allocator),
                escalation: None,
            },
        )
    }

    /// Build a kernel over injected collaborators.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidParam`] when `config` fails validation.
    pub fn with_parts(config: KernelConfig, parts: KernelParts) -> KernelResult<Self> {
        config.validate()?;
        let KernelParts {
            clock,
            substrate,
            allocator,
            escalation,
        } = parts;

        let panic = Arc::new(PanicHandler::new(Arc::clone(&clock)));
        let escalation = escalation.unwrap_or_else(|| panic.clone() as Arc<dyn Escalation>);

        let processes = ProcessRegistry::new(substrate, Arc::clone(&allocator));
        let core = KernelCore {
            queues: MessageQueueRegistry::new(
                Arc::clone(&clock),
                Arc::clone(&allocator),
                processes.clone(),
            ),
            events: EventBus::new(Arc::clone(&clock), Arc::clone(&allocator), processes.clone()),
            resources: ResourceRegistry::new(
                Arc::clone(&clock),
                Arc::clone(&allocator),
                processes.clone(),
            ),
            processes,
            watchdogs: WatchdogRegistry::new(
                Arc::clone(&clock),
                Arc::clone(&allocator),
                escalation,
            ),
            timers: TimerRegistry::new(Arc::clone(&clock), Arc::clone(&allocator)),
            config,
            clock,
            allocator,
            panic,
            state: Mutex::new(KernelState::Initializing),
            ticks: AtomicU64::new(0),
            low_memory: AtomicBool::new(false),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        };
        info!("kernel initialized");
        Ok(Self {
            core: Arc::new(core),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the orchestrator thread.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] when the kernel is already running.
    /// - [`KernelError::Substrate`] when the thread cannot be spawned.
    pub fn start(&self) -> KernelResult<()> {
        let mut state = self.core.state.lock();
        if *state == KernelState::Running {
            return Err(KernelError::InvalidParam(
                "kernel is already running".to_string(),
            ));
        }

        *self.core.stop.lock() = false;
        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("flake-kernel".to_string())
            .stack_size(self.core.config.kernel_stack_size)
            .spawn(move || core.run())
            .map_err(|e| KernelError::Substrate(format!("failed to spawn kernel thread: {e}")))?;

        *self.worker.lock() = Some(handle);
        *state = KernelState::Running;
        info!(
            priority = %self.core.config.kernel_priority,
            stack_size = self.core.config.kernel_stack_size,
            "kernel started"
        );
        Ok(())
    }

    /// Stop the orchestrator thread and wait for it to exit.
    ///
    /// Registered processes, watchdogs, timers, queues, subscriptions and
    /// resources stay in place; a later
    /// [`Kernel::start`] resumes sweeping them.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidParam`] when the kernel is not running.
    pub fn shutdown(&self) -> KernelResult<()> {
        let mut state = self.core.state.lock();
        if *state != KernelState::Running {
            return Err(KernelError::InvalidParam(format!(
                "kernel is not running (state: {})",
                *state
            )));
        }

        *self.core.stop.lock() = true;
        self.core.wake.notify_all();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            error!("kernel thread panicked");
        }
        *state = KernelState::Stopped;
        info!("kernel stopped");
        Ok(())
    }

    /// Run one orchestrator cycle on the calling thread.
    pub fn tick(&self) -> TickReport {
        self.core.tick()
    }

    pub fn state(&self) -> KernelState {
        *self.core.state.lock()
    }

    /// Ticks run since the kernel was built.
    pub fn tick_count(&self) -> u64 {
        self.core.ticks.load(Ordering::SeqCst)
    }

    /// Time since the kernel's clock origin.
    pub fn uptime(&self) -> Duration {
        self.core.clock.now()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.core.config
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.core.processes
    }

    pub fn watchdogs(&self) -> &WatchdogRegistry {
        &self.core.watchdogs
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.core.timers
    }

    pub fn queues(&self) -> &MessageQueueRegistry {
        &self.core.queues
    }

    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.core.resources
    }

    pub fn panic_handler(&self) -> &PanicHandler {
        &self.core.panic
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.core.allocator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.core.clock
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if self.state() == KernelState::Running {
            let _ = self.shutdown();
        }
    }
}
