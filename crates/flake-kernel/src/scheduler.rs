//! [`ProcessRegistry`] – process lifecycle on top of a [`Substrate`].
//!
//! Every process is a registry record plus one thread of control.  The record
//! follows a small state machine:
//!
//! ```text
//! CREATED -> READY -> RUNNING <-> BLOCKED
//!              \________\___________\______-> TERMINATED
//! ```
//!
//! `READY` is entered right after a successful [`ProcessRegistry::create`] and
//! after [`ProcessRegistry::resume`]; the entry-point wrapper sets `RUNNING`
//! just before calling user code and `TERMINATED` when it returns.  A record
//! whose entry point returned keeps its slot (with the thread handle released)
//! until [`ProcessRegistry::terminate`] reaps it.
//!
//! Mutations take the registry lock with an unbounded wait.  The orchestrator's
//! CPU accounting goes through [`ProcessRegistry::account_tick`], which gives
//! up after a bounded wait instead.

use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use flake_types::{
    KernelError, KernelResult, MemoryKind, Pid, Priority, ProcessState, bounded_name,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::memory::{Allocation, Allocator};
use crate::registry::{Arena, SweepOutcome, lock_bounded};
use crate::substrate::{SpawnRequest, Substrate, TaskBody, TaskHandle};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Read-only snapshot of a process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub priority: Priority,
    /// Stack size requested at creation, in bytes.
    pub stack_size: usize,
    /// Orchestrator ticks during which the process was observed `RUNNING`.
    pub cpu_time: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal record
// ────────────────────────────────────────────────────────────────────────────

struct ProcessRecord {
    name: String,
    state: ProcessState,
    priority: Priority,
    stack_size: usize,
    cpu_time: u64,
    task: Option<TaskHandle>,
    _lease: Allocation,
}

impl ProcessRecord {
    fn info(&self, pid: u32) -> ProcessInfo {
        ProcessInfo {
            pid: Pid(pid),
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            stack_size: self.stack_size,
            cpu_time: self.cpu_time,
        }
    }
}

struct Inner {
    table: Mutex<Arena<ProcessRecord>>,
    substrate: Arc<dyn Substrate>,
    allocator: Arc<dyn Allocator>,
}

impl Inner {
    /// Called by the wrapper before user code runs.  Returns `false` when the
    /// record is already gone, in which case the entry point is skipped.
    fn mark_running(weak: &Weak<Inner>, pid: Pid) -> bool {
        let Some(inner) = weak.upgrade() else {
            return false;
        };
        let mut table = inner.table.lock();
        match table.get_mut(pid.0) {
            Some(record) => {
                if !matches!(record.state, ProcessState::Terminated | ProcessState::Blocked) {
                    record.state = ProcessState::Running;
                }
                true
            }
            None => false,
        }
    }

    fn mark_exited(weak: &Weak<Inner>, pid: Pid) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut table = inner.table.lock();
        if let Some(record) = table.get_mut(pid.0) {
            record.state = ProcessState::Terminated;
            record.task = None;
            debug!(pid = %pid, name = %record.name, "process entry point returned");
        }
    }
}

/// Marks the record `TERMINATED` however the wrapper is left: normal return,
/// a panic in user code, or cancellation by the substrate.
struct ExitGuard {
    inner: Weak<Inner>,
    pid: Pid,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        Inner::mark_exited(&self.inner, self.pid);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ProcessRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Owns the set of live processes.
///
/// Cloning yields another handle onto the same registry, which is how entry
/// points get access to [`ProcessRegistry::get_current`] and
/// [`ProcessRegistry::yield_now`].
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<Inner>,
}

impl ProcessRegistry {
    pub fn new(substrate: Arc<dyn Substrate>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Arena::new()),
                substrate,
                allocator,
            }),
        }
    }

    /// Spawn `entry` on a new thread of control and register it as `name`.
    ///
    /// Names longer than [`flake_types::MAX_NAME_LEN`] bytes are truncated.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for a blank name or a zero stack size.
    /// - [`KernelError::Memory`] when the record cannot be allocated.
    /// - [`KernelError::Substrate`] when the thread cannot be spawned.
    ///
    /// On error the registry is left unchanged and no pid is consumed.
    pub fn create<F>(
        &self,
        name: &str,
        entry: F,
        stack_size: usize,
        priority: Priority,
    ) -> KernelResult<Pid>
    where
        F: FnOnce() + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(KernelError::InvalidParam(
                "process name must not be empty".to_string(),
            ));
        }
        if stack_size == 0 {
            return Err(KernelError::InvalidParam(
                "stack size must be non-zero".to_string(),
            ));
        }
        let name = bounded_name(name);

        let pid = {
            let mut table = self.inner.table.lock();
            let lease = self
                .inner
                .allocator
                .allocate(mem::size_of::<ProcessRecord>(), MemoryKind::Internal)?;
            let pid = Pid(table.peek_id()?);

            let weak = Arc::downgrade(&self.inner);
            let body: TaskBody = Box::new(move || {
                let _exit = ExitGuard {
                    inner: weak.clone(),
                    pid,
                };
                if Inner::mark_running(&weak, pid) {
                    entry();
                }
            });

            // The wrapper blocks on the table lock until the record below is
            // committed, so it can never observe a missing record for a live pid.
            let task = self.inner.substrate.spawn(SpawnRequest {
                name: name.clone(),
                stack_size,
                priority: priority.substrate_level(),
                body,
            })?;

            table.commit(
                pid.0,
                ProcessRecord {
                    name: name.clone(),
                    state: ProcessState::Ready,
                    priority,
                    stack_size,
                    cpu_time: 0,
                    task: Some(task),
                    _lease: lease,
                },
            );
            pid
        };

        info!(pid = %pid, name = %name, priority = %priority, stack_size, "process created");
        Ok(pid)
    }

    /// Stop the process's thread and remove its record.
    ///
    /// Termination is not cooperative.  The thread is cancelled at its next
    /// suspension point; guards owned by the entry point are dropped, but
    /// resources reachable only through raw handles are leaked.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown pid.
    pub fn terminate(&self, pid: Pid) -> KernelResult<()> {
        let record = self
            .inner
            .table
            .lock()
            .remove(pid.0)
            .ok_or_else(|| not_found(pid))?;

        if let Some(task) = record.task {
            self.inner.substrate.delete(task);
        }
        info!(pid = %pid, name = %record.name, "process terminated");
        Ok(())
    }

    /// Halt scheduling of the process and mark it `BLOCKED`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] for an unknown pid.
    /// - [`KernelError::InvalidParam`] when the process is `TERMINATED`.
    pub fn suspend(&self, pid: Pid) -> KernelResult<()> {
        self.transition(pid, "suspend", ProcessState::Blocked, |substrate, task| {
            substrate.suspend(task)
        })
    }

    /// Make a suspended process schedulable again and mark it `READY`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] for an unknown pid.
    /// - [`KernelError::InvalidParam`] when the process is `TERMINATED`.
    pub fn resume(&self, pid: Pid) -> KernelResult<()> {
        self.transition(pid, "resume", ProcessState::Ready, |substrate, task| {
            substrate.resume(task)
        })
    }

    fn transition(
        &self,
        pid: Pid,
        action: &str,
        target: ProcessState,
        apply: impl FnOnce(&dyn Substrate, TaskHandle),
    ) -> KernelResult<()> {
        let mut table = self.inner.table.lock();
        let record = table.get_mut(pid.0).ok_or_else(|| not_found(pid))?;

        if record.state.is_terminal() {
            warn!(pid = %pid, action, "rejected: process is terminated");
            return Err(KernelError::InvalidParam(format!(
                "cannot {action} terminated process {pid}"
            )));
        }
        if let Some(task) = record.task {
            apply(self.inner.substrate.as_ref(), task);
        }
        record.state = target;
        info!(pid = %pid, name = %record.name, action, state = %target, "process state changed");
        Ok(())
    }

    /// Snapshot of one process.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown pid.
    pub fn get(&self, pid: Pid) -> KernelResult<ProcessInfo> {
        self.inner
            .table
            .lock()
            .get(pid.0)
            .map(|record| record.info(pid.0))
            .ok_or_else(|| not_found(pid))
    }

    /// Snapshots of every record, in pid order.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.inner
            .table
            .lock()
            .iter()
            .map(|(pid, record)| record.info(pid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The process the caller is running on, or `None` when the caller is not
    /// a registered process (the orchestrator, the main thread).
    pub fn get_current(&self) -> Option<ProcessInfo> {
        let task = self.inner.substrate.current()?;
        self.inner
            .table
            .lock()
            .iter()
            .find(|(_, record)| record.task == Some(task))
            .map(|(pid, record)| record.info(pid))
    }

    /// Give up the CPU.  A zero `delay` yields once; otherwise sleeps.
    pub fn yield_now(&self, delay: Duration) {
        self.inner.substrate.yield_now(delay);
    }

    /// Charge one tick of CPU time to every `RUNNING` process.
    pub fn account_tick(&self, bound: Duration) -> SweepOutcome {
        let Some(mut table) = lock_bounded(&self.inner.table, bound) else {
            debug!("process table busy, accounting skipped");
            return SweepOutcome::Skipped;
        };

        let mut visited = 0;
        let mut acted = 0;
        for (_, record) in table.iter_mut() {
            visited += 1;
            if record.state == ProcessState::Running {
                record.cpu_time += 1;
                acted += 1;
            }
        }
        SweepOutcome::Completed { visited, acted }
    }
}

fn not_found(pid: Pid) -> KernelError {
    KernelError::NotFound(format!("process {pid}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BudgetAllocator, MemoryBudgets};
    use crate::substrate::ThreadSubstrate;
    use crate::substrate::testing::RecordingSubstrate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn registry() -> (Arc<RecordingSubstrate>, BudgetAllocator, ProcessRegistry) {
        let substrate = Arc::new(RecordingSubstrate::default());
        let allocator = BudgetAllocator::default();
        let registry = ProcessRegistry::new(substrate.clone(), Arc::new(allocator.clone()));
        (substrate, allocator, registry)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn worker_is_ready_after_create() {
        let (substrate, _, registry) = registry();
        let pid = registry
            .create("Worker", || {}, 4096, Priority::Normal)
            .unwrap();

        assert_eq!(pid, Pid(1));
        let info = registry.get(pid).unwrap();
        assert_eq!(info.name, "Worker");
        assert_eq!(info.state, ProcessState::Ready);
        assert_eq!(info.stack_size, 4096);
        assert_eq!(info.cpu_time, 0);
        assert_eq!(
            substrate.requests.lock()[0],
            ("Worker".to_string(), 4096, Priority::Normal.substrate_level())
        );
    }

    #[test]
    fn pids_are_unique_and_increasing() {
        let (_, _, registry) = registry();
        let mut last = Pid(0);
        for i in 0..5 {
            let pid = registry
                .create(&format!("p{i}"), || {}, 1024, Priority::Low)
                .unwrap();
            assert!(pid > last);
            last = pid;
            if i % 2 == 0 {
                registry.terminate(pid).unwrap();
            }
        }
        assert_eq!(last, Pid(5));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let (_, _, registry) = registry();
        assert!(matches!(
            registry.create("  ", || {}, 4096, Priority::Normal),
            Err(KernelError::InvalidParam(_))
        ));
        assert!(matches!(
            registry.create("zero", || {}, 0, Priority::Normal),
            Err(KernelError::InvalidParam(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn long_names_are_truncated() {
        let (_, _, registry) = registry();
        let pid = registry
            .create(&"n".repeat(64), || {}, 4096, Priority::Normal)
            .unwrap();
        assert_eq!(registry.get(pid).unwrap().name.len(), flake_types::MAX_NAME_LEN);
    }

    #[test]
    fn entry_wrapper_drives_running_then_terminated() {
        let (substrate, _, registry) = registry();
        let observed = Arc::new(Mutex::new(None));
        let (slot, handle) = (Arc::clone(&observed), registry.clone());
        let pid = registry
            .create(
                "Worker",
                move || *slot.lock() = Some(handle.get(Pid(1)).unwrap().state),
                4096,
                Priority::Normal,
            )
            .unwrap();

        substrate.run(substrate.handles()[0]);

        assert_eq!(*observed.lock(), Some(ProcessState::Running));
        assert_eq!(registry.get(pid).unwrap().state, ProcessState::Terminated);
        // Reaping an exited process does not touch the released thread.
        registry.terminate(pid).unwrap();
        assert!(substrate.deleted.lock().is_empty());
    }

    #[test]
    fn panicking_entry_still_terminates_record() {
        let (substrate, _, registry) = registry();
        let pid = registry
            .create("faulty", || panic!("boom"), 4096, Priority::Normal)
            .unwrap();
        let task = substrate.handles()[0];
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| substrate.run(task)));
        assert!(outcome.is_err());
        assert_eq!(registry.get(pid).unwrap().state, ProcessState::Terminated);
    }

    #[test]
    fn terminated_process_rejects_suspend_and_resume() {
        let (substrate, _, registry) = registry();
        let pid = registry
            .create("done", || {}, 4096, Priority::Normal)
            .unwrap();
        substrate.run(substrate.handles()[0]);

        assert!(matches!(registry.suspend(pid), Err(KernelError::InvalidParam(_))));
        assert!(matches!(registry.resume(pid), Err(KernelError::InvalidParam(_))));
        assert_eq!(registry.get(pid).unwrap().state, ProcessState::Terminated);
        assert!(substrate.suspended.lock().is_empty());
        assert!(substrate.resumed.lock().is_empty());
    }

    #[test]
    fn suspend_and_resume_reach_the_substrate() {
        let (substrate, _, registry) = registry();
        let pid = registry
            .create("Worker", || {}, 4096, Priority::High)
            .unwrap();
        let task = substrate.handles()[0];

        registry.suspend(pid).unwrap();
        assert_eq!(registry.get(pid).unwrap().state, ProcessState::Blocked);
        registry.resume(pid).unwrap();
        assert_eq!(registry.get(pid).unwrap().state, ProcessState::Ready);

        assert_eq!(*substrate.suspended.lock(), vec![task]);
        assert_eq!(*substrate.resumed.lock(), vec![task]);
    }

    #[test]
    fn unknown_pid_is_not_found() {
        let (_, _, registry) = registry();
        for result in [
            registry.terminate(Pid(9)),
            registry.suspend(Pid(9)),
            registry.resume(Pid(9)),
        ] {
            assert!(matches!(result, Err(KernelError::NotFound(_))));
        }
        assert!(registry.get(Pid(9)).is_err());
    }

    #[test]
    fn create_then_terminate_leaves_nothing_behind() {
        let (substrate, allocator, registry) = registry();
        let pids: Vec<Pid> = (0..8)
            .map(|i| {
                registry
                    .create(&format!("w{i}"), || {}, 2048, Priority::Normal)
                    .unwrap()
            })
            .collect();
        for pid in &pids {
            registry.terminate(*pid).unwrap();
        }

        assert!(registry.is_empty());
        assert!(pids.iter().all(|pid| registry.get(*pid).is_err()));
        assert_eq!(allocator.stats(MemoryKind::Internal).used, 0);
        assert_eq!(substrate.deleted.lock().len(), pids.len());
    }

    #[test]
    fn allocation_failure_rolls_back_without_consuming_a_pid() {
        let substrate = Arc::new(RecordingSubstrate::default());
        let allocator = BudgetAllocator::new(MemoryBudgets {
            internal: mem::size_of::<ProcessRecord>(),
            spiram: 0,
            dma: 0,
        });
        let registry = ProcessRegistry::new(substrate.clone(), Arc::new(allocator.clone()));

        let first = registry.create("a", || {}, 4096, Priority::Normal).unwrap();
        let err = registry.create("b", || {}, 4096, Priority::Normal).unwrap_err();
        assert!(matches!(err, KernelError::Memory(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(substrate.requests.lock().len(), 1);

        registry.terminate(first).unwrap();
        let next = registry.create("c", || {}, 4096, Priority::Normal).unwrap();
        assert_eq!(next, Pid(2));
    }

    #[test]
    fn spawn_failure_is_a_substrate_error() {
        let (substrate, allocator, registry) = registry();
        *substrate.fail_spawn.lock() = true;

        let err = registry.create("x", || {}, 4096, Priority::Normal).unwrap_err();
        assert!(matches!(err, KernelError::Substrate(_)));
        assert!(registry.is_empty());
        assert_eq!(allocator.stats(MemoryKind::Internal).used, 0);

        *substrate.fail_spawn.lock() = false;
        assert_eq!(
            registry.create("y", || {}, 4096, Priority::Normal).unwrap(),
            Pid(1)
        );
    }

    #[test]
    fn get_current_resolves_the_calling_task() {
        let (substrate, _, registry) = registry();
        registry.create("a", || {}, 4096, Priority::Normal).unwrap();
        let pid = registry.create("b", || {}, 4096, Priority::Normal).unwrap();

        assert!(registry.get_current().is_none());
        *substrate.current.lock() = Some(substrate.handles()[1]);
        assert_eq!(registry.get_current().unwrap().pid, pid);
    }

    #[test]
    fn accounting_charges_running_processes_only() {
        let (substrate, _, registry) = registry();
        let running = registry.clone();
        let pid = registry
            .create(
                "busy",
                move || {
                    running.account_tick(Duration::from_millis(10));
                    running.account_tick(Duration::from_millis(10));
                },
                4096,
                Priority::Normal,
            )
            .unwrap();
        let idle = registry.create("idle", || {}, 4096, Priority::Normal).unwrap();

        substrate.run(substrate.handles()[0]);

        assert_eq!(registry.get(pid).unwrap().cpu_time, 2);
        assert_eq!(registry.get(idle).unwrap().cpu_time, 0);
        assert_eq!(
            registry.account_tick(Duration::from_millis(10)),
            SweepOutcome::Completed { visited: 2, acted: 0 }
        );
    }

    #[test]
    fn accounting_skips_when_table_is_held() {
        let (_, _, registry) = registry();
        registry.create("w", || {}, 4096, Priority::Normal).unwrap();

        let _held = registry.inner.table.lock();
        let start = Instant::now();
        assert!(registry.account_tick(Duration::from_millis(5)).is_skipped());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn hosted_process_exits_into_terminated() {
        let substrate = ThreadSubstrate::new();
        let registry = ProcessRegistry::new(
            Arc::new(substrate.clone()),
            Arc::new(BudgetAllocator::default()),
        );
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let pid = registry
            .create("oneshot", move || flag.store(true, Ordering::SeqCst), 4096, Priority::Normal)
            .unwrap();

        assert!(wait_for(|| registry.get(pid).unwrap().state == ProcessState::Terminated));
        assert!(ran.load(Ordering::SeqCst));
        assert!(wait_for(|| substrate.live_tasks() == 0));
        registry.terminate(pid).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn hosted_process_sees_itself_and_can_be_terminated() {
        let substrate = ThreadSubstrate::new();
        let registry = ProcessRegistry::new(
            Arc::new(substrate.clone()),
            Arc::new(BudgetAllocator::default()),
        );
        let me = Arc::new(Mutex::new(None));
        let (slot, inner) = (Arc::clone(&me), registry.clone());
        let pid = registry
            .create(
                "looper",
                move || {
                    *slot.lock() = inner.get_current().map(|p| p.pid);
                    loop {
                        inner.yield_now(Duration::from_millis(2));
                    }
                },
                4096,
                Priority::Normal,
            )
            .unwrap();

        assert!(wait_for(|| me.lock().is_some()));
        assert_eq!(*me.lock(), Some(pid));
        assert_eq!(registry.get(pid).unwrap().state, ProcessState::Running);

        registry.terminate(pid).unwrap();
        assert!(wait_for(|| substrate.live_tasks() == 0));
        assert!(registry.get(pid).is_err());
    }
}
