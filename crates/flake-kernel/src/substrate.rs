//! The thread-of-control layer the kernel runs on.
//!
//! The process registry never touches threads directly; it goes through the
//! [`Substrate`] trait.  On a microcontroller this would wrap the RTOS task
//! API.  [`ThreadSubstrate`] is the hosted implementation over `std::thread`.
//!
//! # Suspension and cancellation
//!
//! Hosted threads cannot be frozen or killed from the outside, so
//! [`ThreadSubstrate`] gives every thread a control block and applies
//! `suspend` / `delete` at the target's next suspension point: the start of
//! the thread and every [`Substrate::yield_now`] call made from it.
//!
//! Cancellation unwinds the target's stack.  Guards owned by the entry point
//! (mutex guards, boxed buffers) are dropped on the way out; anything held
//! through a raw handle or shared with another thread is **not** cleaned up.
//! Callers must release such resources before terminating a process.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use flake_types::{KernelError, KernelResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

/// Smallest stack handed to a hosted thread, whatever size was requested.
pub const MIN_HOSTED_STACK: usize = 64 * 1024;

/// Code run on a spawned thread of control.
pub type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// Opaque reference to a thread of control owned by a [`Substrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Everything the substrate needs to start a thread of control.
pub struct SpawnRequest {
    pub name: String,
    /// Requested stack size in bytes.
    pub stack_size: usize,
    /// Substrate-level numeric priority (see [`flake_types::Priority::substrate_level`]).
    pub priority: u8,
    pub body: TaskBody,
}

/// Preemptive thread-of-control primitives consumed by the process registry.
pub trait Substrate: Send + Sync {
    /// Start a new thread of control running `request.body`.
    ///
    /// The body must run on the new thread of control, never on the caller's.
    /// [`crate::ProcessRegistry::create`] holds its table lock across this
    /// call and the body's first action takes that same lock, so running the
    /// body synchronously here deadlocks.
    ///
    /// # Errors
    ///
    /// [`KernelError::Substrate`] when the thread cannot be created.
    fn spawn(&self, request: SpawnRequest) -> KernelResult<TaskHandle>;

    /// Stop scheduling `task` until [`Substrate::resume`] is called.
    fn suspend(&self, task: TaskHandle);

    /// Make a suspended `task` schedulable again.
    fn resume(&self, task: TaskHandle);

    /// Stop `task` for good, without giving it a chance to clean up.
    fn delete(&self, task: TaskHandle);

    /// The task the caller is running on, if it was spawned by this substrate.
    fn current(&self) -> Option<TaskHandle>;

    /// Give up the CPU: once when `delay` is zero, otherwise sleep for `delay`.
    fn yield_now(&self, delay: Duration);
}

// ────────────────────────────────────────────────────────────────────────────
// ThreadSubstrate
// ────────────────────────────────────────────────────────────────────────────

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Unwind payload used to cancel a thread.
struct Cancelled;

#[derive(Default)]
struct ControlFlags {
    suspended: bool,
    cancelled: bool,
}

#[derive(Default)]
struct TaskControl {
    flags: Mutex<ControlFlags>,
    wake: Condvar,
}

impl TaskControl {
    /// Park while suspended; unwind if cancelled.
    fn checkpoint(&self) {
        let mut flags = self.flags.lock();
        loop {
            if flags.cancelled {
                drop(flags);
                panic::resume_unwind(Box::new(Cancelled));
            }
            if !flags.suspended {
                return;
            }
            self.wake.wait(&mut flags);
        }
    }

    /// Sleep for `delay`, cut short by cancellation.
    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut flags = self.flags.lock();
        while !flags.cancelled && Instant::now() < deadline {
            self.wake.wait_until(&mut flags, deadline);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(TaskHandle, Arc<TaskControl>)>> = const { RefCell::new(None) };
}

fn current_control() -> Option<(TaskHandle, Arc<TaskControl>)> {
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .map(|(handle, control)| (*handle, Arc::clone(control)))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// [`Substrate`] over detached `std::thread`s.
///
/// Requested priorities are recorded in the logs only; hosted threads run at
/// the operating system's default priority.
#[derive(Clone, Default)]
pub struct ThreadSubstrate {
    tasks: Arc<Mutex<HashMap<TaskHandle, Arc<TaskControl>>>>,
}

impl ThreadSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads spawned by this substrate that have not yet exited
    /// or been deleted.
    pub fn live_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    fn control(&self, task: TaskHandle) -> Option<Arc<TaskControl>> {
        self.tasks.lock().get(&task).cloned()
    }
}

impl Substrate for ThreadSubstrate {
    fn spawn(&self, request: SpawnRequest) -> KernelResult<TaskHandle> {
        let SpawnRequest {
            name,
            stack_size,
            priority,
            body,
        } = request;

        let handle = TaskHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        let control = Arc::new(TaskControl::default());
        self.tasks.lock().insert(handle, Arc::clone(&control));

        debug!(task = handle.0, name = %name, stack_size, priority, "spawning thread");

        let tasks = Arc::clone(&self.tasks);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size.max(MIN_HOSTED_STACK))
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some((handle, Arc::clone(&control))));
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    control.checkpoint();
                    body();
                }));
                if let Err(payload) = outcome {
                    if payload.is::<Cancelled>() {
                        debug!(task = handle.0, "thread cancelled");
                    } else {
                        error!(task = handle.0, reason = %panic_message(payload.as_ref()), "thread panicked");
                    }
                }
                tasks.lock().remove(&handle);
                CURRENT.with(|c| c.borrow_mut().take());
            });

        match spawned {
            Ok(_detached) => Ok(handle),
            Err(e) => {
                self.tasks.lock().remove(&handle);
                Err(KernelError::Substrate(format!(
                    "failed to spawn thread '{name}': {e}"
                )))
            }
        }
    }

    fn suspend(&self, task: TaskHandle) {
        if let Some(control) = self.control(task) {
            control.flags.lock().suspended = true;
        }
    }

    fn resume(&self, task: TaskHandle) {
        if let Some(control) = self.control(task) {
            control.flags.lock().suspended = false;
            control.wake.notify_all();
        }
    }

    fn delete(&self, task: TaskHandle) {
        let control = self.tasks.lock().remove(&task);
        if let Some(control) = control {
            control.flags.lock().cancelled = true;
            control.wake.notify_all();
        }
    }

    fn current(&self) -> Option<TaskHandle> {
        let (handle, _) = current_control()?;
        self.tasks.lock().contains_key(&handle).then_some(handle)
    }

    fn yield_now(&self, delay: Duration) {
        match current_control() {
            Some((_, control)) => {
                if delay.is_zero() {
                    thread::yield_now();
                } else {
                    control.sleep(delay);
                }
                control.checkpoint();
            }
            None if delay.is_zero() => thread::yield_now(),
            None => thread::sleep(delay),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Test double
// ────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

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

    fn request(name: &str, body: impl FnOnce() + Send + 'static) -> SpawnRequest {
        SpawnRequest {
            name: name.to_string(),
            stack_size: 4096,
            priority: 3,
            body: Box::new(body),
        }
    }

    #[test]
    fn spawned_body_runs_and_thread_is_released() {
        let substrate = ThreadSubstrate::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        substrate
            .spawn(request("runner", move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        assert!(wait_for(|| ran.load(Ordering::SeqCst)));
        assert!(wait_for(|| substrate.live_tasks() == 0));
    }

    #[test]
    fn body_runs_off_the_spawning_thread() {
        let substrate = ThreadSubstrate::new();
        let caller = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        substrate
            .spawn(request("elsewhere", move || {
                *slot.lock() = Some(thread::current().id());
            }))
            .unwrap();

        assert!(wait_for(|| seen.lock().is_some()));
        assert_ne!(*seen.lock(), Some(caller));
    }

    #[test]
    fn current_is_known_inside_and_unknown_outside() {
        let substrate = ThreadSubstrate::new();
        assert!(substrate.current().is_none());

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let inner = substrate.clone();
        let handle = substrate
            .spawn(request("introspect", move || {
                *slot.lock() = inner.current();
            }))
            .unwrap();

        assert!(wait_for(|| seen.lock().is_some()));
        assert_eq!(*seen.lock(), Some(handle));
    }

    #[test]
    fn suspend_parks_at_next_yield_until_resumed() {
        let substrate = ThreadSubstrate::new();
        let loops = Arc::new(AtomicUsize::new(0));
        let (counter, inner) = (Arc::clone(&loops), substrate.clone());

        let handle = substrate
            .spawn(request("ticker", move || {
                loop {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inner.yield_now(Duration::from_millis(2));
                }
            }))
            .unwrap();

        assert!(wait_for(|| loops.load(Ordering::SeqCst) > 2));
        substrate.suspend(handle);
        // Let the thread reach its next checkpoint.
        thread::sleep(Duration::from_millis(20));
        let parked_at = loops.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(loops.load(Ordering::SeqCst), parked_at);

        substrate.resume(handle);
        assert!(wait_for(|| loops.load(Ordering::SeqCst) > parked_at));
        substrate.delete(handle);
    }

    #[test]
    fn delete_unwinds_at_next_yield_and_drops_guards() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let substrate = ThreadSubstrate::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let loops = Arc::new(AtomicUsize::new(0));
        let (guard_flag, counter, inner) = (Arc::clone(&dropped), Arc::clone(&loops), substrate.clone());

        let handle = substrate
            .spawn(request("looper", move || {
                let _guard = DropFlag(guard_flag);
                loop {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inner.yield_now(Duration::from_millis(5));
                }
            }))
            .unwrap();

        assert!(wait_for(|| loops.load(Ordering::SeqCst) > 0));
        substrate.delete(handle);
        assert!(wait_for(|| dropped.load(Ordering::SeqCst)));
        assert_eq!(substrate.live_tasks(), 0);
    }

    #[test]
    fn panicking_body_is_contained() {
        let substrate = ThreadSubstrate::new();
        substrate
            .spawn(request("faulty", || panic!("entry point failure")))
            .unwrap();
        assert!(wait_for(|| substrate.live_tasks() == 0));
    }

    #[test]
    fn yield_outside_managed_thread_just_sleeps() {
        let substrate = ThreadSubstrate::new();
        let start = Instant::now();
        substrate.yield_now(Duration::from_millis(5));
        assert!(start.elapsed() >= Duration::from_millis(5));
        substrate.yield_now(Duration::ZERO);
    }
}
