//! Pluggable allocator for registry records.
//!
//! Every record the registries keep (process control blocks, watchdog tokens,
//! timers) holds an [`Allocation`] lease obtained from an [`Allocator`].  The
//! lease is returned to its pool when dropped, so a `create` call that fails
//! half-way releases whatever it already obtained simply by returning early.
//!
//! [`BudgetAllocator`] is the default implementation: it enforces a byte
//! budget per [`MemoryKind`] and keeps usual heap statistics (used, free,
//! peak, allocation counts).

use std::sync::Arc;

use flake_types::{KernelError, KernelResult, MemoryKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Allocation counters for one memory pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub peak: usize,
    pub allocations: u64,
    pub deallocations: u64,
}

/// Byte budget of each pool managed by [`BudgetAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBudgets {
    pub internal: usize,
    pub spiram: usize,
    pub dma: usize,
}

impl Default for MemoryBudgets {
    fn default() -> Self {
        Self {
            internal: 256 * 1024,
            spiram: 2 * 1024 * 1024,
            dma: 32 * 1024,
        }
    }
}

impl MemoryBudgets {
    fn budget(&self, kind: MemoryKind) -> usize {
        match kind {
            MemoryKind::Internal => self.internal,
            MemoryKind::Spiram => self.spiram,
            MemoryKind::Dma => self.dma,
        }
    }
}

/// Source of memory for registry records.
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes from the `kind` pool.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidParam`] for a zero-sized request.
    /// - [`KernelError::Memory`] when the pool cannot satisfy the request.
    fn allocate(&self, size: usize, kind: MemoryKind) -> KernelResult<Allocation>;

    /// Current counters for the `kind` pool.
    fn stats(&self, kind: MemoryKind) -> MemoryStats;
}

/// RAII lease on memory obtained from an [`Allocator`].
///
/// Dropping the lease returns the memory to its pool.
pub struct Allocation {
    size: usize,
    kind: MemoryKind,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Allocation {
    /// Build a lease that runs `release` when dropped.  Intended for custom
    /// [`Allocator`] implementations.
    pub fn new(size: usize, kind: MemoryKind, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            size,
            kind,
            release: Some(Box::new(release)),
        }
    }

    /// A lease with nothing to give back on drop.
    pub fn untracked(size: usize, kind: MemoryKind) -> Self {
        Self {
            size,
            kind,
            release: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BudgetAllocator
// ────────────────────────────────────────────────────────────────────────────

/// Allocator that accounts requests against a fixed byte budget per pool.
///
/// # Example
///
/// ```
/// use flake_kernel::memory::{Allocator, BudgetAllocator, MemoryBudgets};
/// use flake_types::{KernelError, MemoryKind};
///
/// let alloc = BudgetAllocator::new(MemoryBudgets { internal: 128, spiram: 0, dma: 0 });
/// let lease = alloc.allocate(100, MemoryKind::Internal).unwrap();
/// assert!(matches!(alloc.allocate(100, MemoryKind::Internal), Err(KernelError::Memory(_))));
///
/// drop(lease);
/// assert_eq!(alloc.stats(MemoryKind::Internal).used, 0);
/// ```
#[derive(Clone)]
pub struct BudgetAllocator {
    pools: Arc<Mutex<[MemoryStats; 3]>>,
}

impl BudgetAllocator {
    pub fn new(budgets: MemoryBudgets) -> Self {
        let pools = MemoryKind::ALL.map(|kind| {
            let total = budgets.budget(kind);
            MemoryStats {
                total,
                free: total,
                ..MemoryStats::default()
            }
        });
        Self {
            pools: Arc::new(Mutex::new(pools)),
        }
    }
}

impl Default for BudgetAllocator {
    fn default() -> Self {
        Self::new(MemoryBudgets::default())
    }
}

impl Allocator for BudgetAllocator {
    fn allocate(&self, size: usize, kind: MemoryKind) -> KernelResult<Allocation> {
        if size == 0 {
            return Err(KernelError::InvalidParam(
                "allocation size must be non-zero".to_string(),
            ));
        }

        {
            let mut pools = self.pools.lock();
            let pool = &mut pools[kind.slot()];
            if size > pool.free {
                return Err(KernelError::Memory(format!(
                    "{kind} pool exhausted: requested {size} bytes, {} free",
                    pool.free
                )));
            }
            pool.used += size;
            pool.free -= size;
            pool.peak = pool.peak.max(pool.used);
            pool.allocations += 1;
        }
        debug!(size, pool = %kind, "allocated");

        let pools = Arc::clone(&self.pools);
        Ok(Allocation::new(size, kind, move || {
            let mut pools = pools.lock();
            let pool = &mut pools[kind.slot()];
            pool.used -= size;
            pool.free += size;
            pool.deallocations += 1;
        }))
    }

    fn stats(&self, kind: MemoryKind) -> MemoryStats {
        self.pools.lock()[kind.slot()]
    }
}
