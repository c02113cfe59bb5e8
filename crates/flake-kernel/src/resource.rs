//! [`ResourceRegistry`] – ownership tracking for process-held resources.
//!
//! Terminating a process does not unwind what it holds through raw handles.
//! Processes register such resources here, optionally with a release hook;
//! whoever terminates the process then calls
//! [`ResourceRegistry::cleanup_for_process`], which removes every resource the
//! process owns and runs the hooks with the registry lock released.
//!
//! A resource starts with a reference count of one.  A non-shareable resource
//! that is still referenced can only be acquired again by its owner.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use flake_types::{
    KernelError, KernelResult, MemoryKind, Pid, ResourceId, ResourceKind, bounded_name,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::memory::{Allocation, Allocator};
use crate::registry::Arena;
use crate::scheduler::ProcessRegistry;

type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

/// Read-only snapshot of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    /// Process that registered the resource, if it was registered from one.
    pub owner: Option<Pid>,
    pub ref_count: u32,
    pub shareable: bool,
    /// Clock reading at registration.
    pub created: Duration,
}

struct ResourceRecord {
    name: String,
    kind: ResourceKind,
    owner: Option<Pid>,
    ref_count: u32,
    shareable: bool,
    created: Duration,
    release: Option<ReleaseHook>,
    _lease: Allocation,
}

impl ResourceRecord {
    fn info(&self, id: u32) -> ResourceInfo {
        ResourceInfo {
            id: ResourceId(id),
            name: self.name.clone(),
            kind: self.kind,
            owner: self.owner,
            ref_count: self.ref_count,
            shareable: self.shareable,
            created: self.created,
        }
    }
}

struct Inner {
    resources: Mutex<Arena<ResourceRecord>>,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn Allocator>,
    processes: ProcessRegistry,
}

/// Owns the set of tracked resources.
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<Inner>,
}

impl ResourceRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        allocator: Arc<dyn Allocator>,
        processes: ProcessRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resources: Mutex::new(Arena::new()),
                clock,
                allocator,
                processes,
            }),
        }
    }

    /// Track a resource owned by the calling process.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for an empty name.
    /// - [`KernelError::Memory`] when the record cannot be allocated.
    pub fn register(
        &self,
        name: &str,
        kind: ResourceKind,
        shareable: bool,
    ) -> KernelResult<ResourceId> {
        self.insert(name, kind, shareable, None)
    }

    /// Like [`ResourceRegistry::register`], with `release` run when the
    /// resource is cleaned up or unregistered.
    ///
    /// # Errors
    ///
    /// See [`ResourceRegistry::register`].
    pub fn register_with<F>(
        &self,
        name: &str,
        kind: ResourceKind,
        shareable: bool,
        release: F,
    ) -> KernelResult<ResourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert(name, kind, shareable, Some(Box::new(release)))
    }

    fn insert(
        &self,
        name: &str,
        kind: ResourceKind,
        shareable: bool,
        release: Option<ReleaseHook>,
    ) -> KernelResult<ResourceId> {
        if name.is_empty() {
            return Err(KernelError::InvalidParam(
                "resource name must not be empty".to_string(),
            ));
        }
        let name = bounded_name(name);
        let owner = self.inner.processes.get_current().map(|p| p.pid);
        let created = self.inner.clock.now();

        let id = {
            let mut resources = self.inner.resources.lock();
            let lease = self
                .inner
                .allocator
                .allocate(mem::size_of::<ResourceRecord>(), MemoryKind::Internal)?;
            resources.insert(ResourceRecord {
                name: name.clone(),
                kind,
                owner,
                ref_count: 1,
                shareable,
                created,
                release,
                _lease: lease,
            })?
        };

        info!(resource = %name, id, kind = %kind, owner = ?owner.map(|p| p.0), "resource registered");
        Ok(ResourceId(id))
    }

    /// Take another reference on the resource for `pid`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] for an unknown id.
    /// - [`KernelError::Conflict`] when the resource is not shareable and is
    ///   held by another process.
    pub fn acquire(&self, id: ResourceId, pid: Pid) -> KernelResult<()> {
        let mut resources = self.inner.resources.lock();
        let record = resources.get_mut(id.0).ok_or_else(|| not_found(id))?;
        if !record.shareable && record.ref_count > 0 && record.owner != Some(pid) {
            warn!(resource = %record.name, pid = %pid, "resource is not shareable and already owned");
            return Err(KernelError::Conflict(format!(
                "resource '{}' is held exclusively",
                record.name
            )));
        }
        record.ref_count = record.ref_count.saturating_add(1);
        debug!(resource = %record.name, pid = %pid, ref_count = record.ref_count, "resource acquired");
        Ok(())
    }

    /// Drop one reference.  The count never goes below zero.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn release(&self, id: ResourceId, pid: Pid) -> KernelResult<()> {
        let mut resources = self.inner.resources.lock();
        let record = resources.get_mut(id.0).ok_or_else(|| not_found(id))?;
        record.ref_count = record.ref_count.saturating_sub(1);
        debug!(resource = %record.name, pid = %pid, ref_count = record.ref_count, "resource released");
        Ok(())
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] when no resource has that name.
    pub fn find_by_name(&self, name: &str) -> KernelResult<ResourceId> {
        let name = bounded_name(name);
        self.inner
            .resources
            .lock()
            .iter()
            .find(|(_, record)| record.name == name)
            .map(|(id, _)| ResourceId(id))
            .ok_or_else(|| KernelError::NotFound(format!("resource '{name}'")))
    }

    /// Stop tracking the resource and run its release hook.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn unregister(&self, id: ResourceId) -> KernelResult<()> {
        let record = self
            .inner
            .resources
            .lock()
            .remove(id.0)
            .ok_or_else(|| not_found(id))?;
        info!(resource = %record.name, id = id.0, "resource unregistered");
        run_release(id.0, record);
        Ok(())
    }

    /// Remove every resource owned by `pid` and run their release hooks.
    /// Returns how many were removed.
    pub fn cleanup_for_process(&self, pid: Pid) -> usize {
        let owned: Vec<(u32, ResourceRecord)> = {
            let mut resources = self.inner.resources.lock();
            let ids: Vec<u32> = resources
                .iter()
                .filter(|(_, record)| record.owner == Some(pid))
                .map(|(id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| resources.remove(id).map(|record| (id, record)))
                .collect()
        };

        let cleaned = owned.len();
        for (id, record) in owned {
            debug!(resource = %record.name, id, "cleaning up resource");
            run_release(id, record);
        }
        info!(pid = %pid, cleaned, "resources cleaned up");
        cleaned
    }

    /// # Errors
    ///
    /// [`KernelError::NotFound`] for an unknown id.
    pub fn get(&self, id: ResourceId) -> KernelResult<ResourceInfo> {
        self.inner
            .resources
            .lock()
            .get(id.0)
            .map(|record| record.info(id.0))
            .ok_or_else(|| not_found(id))
    }

    pub fn list(&self) -> Vec<ResourceInfo> {
        self.inner
            .resources
            .lock()
            .iter()
            .map(|(id, record)| record.info(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn run_release(id: u32, mut record: ResourceRecord) {
    if let Some(release) = record.release.take()
        && panic::catch_unwind(AssertUnwindSafe(release)).is_err()
    {
        error!(resource = %record.name, id, "resource release hook panicked");
    }
}

fn not_found(id: ResourceId) -> KernelError {
    KernelError::NotFound(format!("resource {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::BudgetAllocator;
    use crate::substrate::testing::RecordingSubstrate;
    use flake_types::Priority;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        substrate: Arc<RecordingSubstrate>,
        allocator: BudgetAllocator,
        processes: ProcessRegistry,
        resources: ResourceRegistry,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let substrate = Arc::new(RecordingSubstrate::default());
        let allocator = BudgetAllocator::default();
        let processes = ProcessRegistry::new(substrate.clone(), Arc::new(allocator.clone()));
        let resources =
            ResourceRegistry::new(clock.clone(), Arc::new(allocator.clone()), processes.clone());
        Fixture {
            clock,
            substrate,
            allocator,
            processes,
            resources,
        }
    }

    /// Create a process and make it the current one.
    fn enter_process(f: &Fixture, name: &str) -> Pid {
        let pid = f
            .processes
            .create(name, || {}, 4096, Priority::Normal)
            .unwrap();
        let handle = *f.substrate.handles().last().unwrap();
        *f.substrate.current.lock() = Some(handle);
        pid
    }

    #[test]
    fn registered_resource_belongs_to_current_process() {
        let f = fixture();
        let pid = enter_process(&f, "driver");
        f.clock.set(Duration::from_millis(75));

        let id = f
            .resources
            .register("spi-bus", ResourceKind::HardwarePeripheral, false)
            .unwrap();
        let info = f.resources.get(id).unwrap();
        assert_eq!(info.owner, Some(pid));
        assert_eq!(info.ref_count, 1);
        assert_eq!(info.created, Duration::from_millis(75));
        assert_eq!(f.resources.find_by_name("spi-bus").unwrap(), id);
    }

    #[test]
    fn exclusive_resource_rejects_other_processes() {
        let f = fixture();
        let owner = enter_process(&f, "owner");
        let id = f.resources.register("uart0", ResourceKind::HardwarePeripheral, false).unwrap();
        let other = Pid(owner.0 + 100);

        let err = f.resources.acquire(id, other).unwrap_err();
        assert!(matches!(err, KernelError::Conflict(_)));
        assert_eq!(err.code(), -1);

        f.resources.acquire(id, owner).unwrap();
        assert_eq!(f.resources.get(id).unwrap().ref_count, 2);

        // Once every reference is dropped anyone may take it.
        f.resources.release(id, owner).unwrap();
        f.resources.release(id, owner).unwrap();
        f.resources.release(id, owner).unwrap();
        assert_eq!(f.resources.get(id).unwrap().ref_count, 0);
        f.resources.acquire(id, other).unwrap();
    }

    #[test]
    fn shareable_resource_counts_every_holder() {
        let f = fixture();
        let id = f.resources.register("log", ResourceKind::File, true).unwrap();
        f.resources.acquire(id, Pid(1)).unwrap();
        f.resources.acquire(id, Pid(2)).unwrap();
        assert_eq!(f.resources.get(id).unwrap().ref_count, 3);
        assert_eq!(f.resources.get(id).unwrap().owner, None);
    }

    #[test]
    fn cleanup_removes_only_the_processes_resources() {
        let f = fixture();
        let baseline = f.allocator.stats(MemoryKind::Internal).used;
        let released = Arc::new(AtomicUsize::new(0));

        let victim = enter_process(&f, "victim");
        for name in ["buf-a", "buf-b"] {
            let hits = Arc::clone(&released);
            f.resources
                .register_with(name, ResourceKind::MemoryRegion, false, move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let survivor = enter_process(&f, "survivor");
        let kept = f.resources.register("sock", ResourceKind::Socket, false).unwrap();

        assert_eq!(f.resources.cleanup_for_process(victim), 2);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(f.resources.len(), 1);
        assert_eq!(f.resources.get(kept).unwrap().owner, Some(survivor));
        assert!(matches!(
            f.resources.find_by_name("buf-a"),
            Err(KernelError::NotFound(_))
        ));
        assert_eq!(f.resources.cleanup_for_process(victim), 0);

        f.resources.unregister(kept).unwrap();
        f.processes.terminate(victim).unwrap();
        f.processes.terminate(survivor).unwrap();
        assert_eq!(f.allocator.stats(MemoryKind::Internal).used, baseline);
    }

    #[test]
    fn panicking_release_hook_is_contained() {
        let f = fixture();
        let pid = enter_process(&f, "fragile");
        f.resources
            .register_with("bad", ResourceKind::Mutex, false, || panic!("release failure"))
            .unwrap();
        f.resources.register("good", ResourceKind::Semaphore, false).unwrap();
        assert_eq!(f.resources.cleanup_for_process(pid), 2);
        assert!(f.resources.is_empty());
    }

    #[test]
    fn unknown_ids_and_empty_names_are_rejected() {
        let f = fixture();
        let ghost = ResourceId(42);
        assert!(matches!(f.resources.acquire(ghost, Pid(1)), Err(KernelError::NotFound(_))));
        assert!(matches!(f.resources.release(ghost, Pid(1)), Err(KernelError::NotFound(_))));
        assert!(matches!(f.resources.unregister(ghost), Err(KernelError::NotFound(_))));
        assert!(matches!(f.resources.get(ghost), Err(KernelError::NotFound(_))));
        assert!(matches!(
            f.resources.register("", ResourceKind::File, true),
            Err(KernelError::InvalidParam(_))
        ));
    }
}
