//! `flake-kernel` – the kernel control plane.
//!
//! Gives application code a process abstraction with lifecycle tracking, a
//! software watchdog and a timer facility on top of whatever preemptive
//! threading substrate is available, without exposing the substrate's raw
//! primitives.  Message queues, an event bus and resource ownership tracking
//! complete the set of services processes build on.
//!
//! # Modules
//!
//! - [`scheduler`] – [`ProcessRegistry`][scheduler::ProcessRegistry]:
//!   creates, suspends, resumes and terminates processes, tracks their state
//!   machine and charges CPU time per tick.
//! - [`watchdog`] – [`WatchdogRegistry`][watchdog::WatchdogRegistry]:
//!   independently timed liveness tokens; starved tokens are escalated.
//! - [`timer`] – [`TimerRegistry`][timer::TimerRegistry]:
//!   one-shot and periodic callbacks fired by the orchestrator.
//! - [`ipc`] – [`MessageQueueRegistry`][ipc::MessageQueueRegistry]:
//!   named, bounded mailboxes with blocking send/receive and broadcast.
//! - [`event`] – [`EventBus`][event::EventBus]: publish/subscribe
//!   notifications delivered once per tick.
//! - [`resource`] – [`ResourceRegistry`][resource::ResourceRegistry]:
//!   per-process resource ownership with cleanup on termination.
//! - [`kernel`] – [`Kernel`][kernel::Kernel]: owns the registries and
//!   drives them from a dedicated fixed-period thread.
//!
//! Collaborators consumed by the registries:
//!
//! - [`clock`] – monotonic time source ([`SystemClock`][clock::SystemClock],
//!   [`ManualClock`][clock::ManualClock]).
//! - [`substrate`] – threads of control ([`ThreadSubstrate`][substrate::ThreadSubstrate]).
//! - [`memory`] – record allocation ([`BudgetAllocator`][memory::BudgetAllocator]).
//! - [`panic`] – fatal-failure escalation ([`PanicHandler`][panic::PanicHandler]).
//!
//! Every registry has its own lock; no lock is held while calling into another
//! registry or into user code.

pub mod clock;
pub mod event;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod panic;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod substrate;
pub mod timer;
pub mod watchdog;

pub use event::{Event, EventBus, SubscriptionInfo};
pub use ipc::{Message, MessageQueueRegistry, QueueInfo};
pub use kernel::{Kernel, KernelConfig, KernelParts, KernelState, TickReport};
pub use panic::{Escalation, PanicHandler, PanicInfo};
pub use registry::{DEFAULT_SWEEP_BOUND, SweepOutcome};
pub use resource::{ResourceInfo, ResourceRegistry};
pub use scheduler::{ProcessInfo, ProcessRegistry};
pub use timer::{TimerInfo, TimerRegistry};
pub use watchdog::{Feeder, WatchdogInfo, WatchdogRegistry};
