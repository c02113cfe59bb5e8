//! Shared registry infrastructure.
//!
//! Each registry owns an [`Arena`] of records keyed by a monotonic `u32` id,
//! guarded by its own [`parking_lot::Mutex`].  Mutating operations take the
//! lock with an unbounded wait; the orchestrator's sweeps go through
//! [`lock_bounded`] and skip the cycle when the lock is contended.

use std::collections::BTreeMap;
use std::time::Duration;

use flake_types::{KernelError, KernelResult};
use parking_lot::{Mutex, MutexGuard};

/// How long a sweep waits for a registry lock before skipping the cycle.
pub const DEFAULT_SWEEP_BOUND: Duration = Duration::from_millis(10);

/// Result of one orchestrator pass over a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The lock was acquired and every record was visited.
    Completed {
        /// Records examined.
        visited: usize,
        /// Records acted upon (accounted, escalated or fired).
        acted: usize,
    },
    /// The lock could not be acquired within the bound; nothing was touched.
    Skipped,
}

impl SweepOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SweepOutcome::Skipped)
    }

    /// Number of records acted upon, zero for a skipped sweep.
    pub fn acted(&self) -> usize {
        match self {
            SweepOutcome::Completed { acted, .. } => *acted,
            SweepOutcome::Skipped => 0,
        }
    }
}

/// Acquire `lock` waiting at most `bound`.
pub(crate) fn lock_bounded<T>(lock: &Mutex<T>, bound: Duration) -> Option<MutexGuard<'_, T>> {
    lock.try_lock_for(bound)
}

/// Id-keyed record storage with a monotonic id counter.
///
/// Ids start at 1 and are never reused.  Allocation of a new id is split in
/// two steps, [`Arena::peek_id`] and [`Arena::commit`], so a creation that
/// fails between them leaves the counter untouched.
pub(crate) struct Arena<T> {
    records: BTreeMap<u32, T>,
    next_id: u32,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// The id the next [`Arena::commit`] will use.
    pub(crate) fn peek_id(&self) -> KernelResult<u32> {
        if self.next_id == u32::MAX {
            return Err(KernelError::Memory("id space exhausted".to_string()));
        }
        Ok(self.next_id)
    }

    /// Store `record` under `id`, which must come from [`Arena::peek_id`].
    pub(crate) fn commit(&mut self, id: u32, record: T) {
        debug_assert_eq!(id, self.next_id, "commit must use the peeked id");
        self.records.insert(id, record);
        self.next_id = id + 1;
    }

    /// Reserve the next id and store `record` under it.
    pub(crate) fn insert(&mut self, record: T) -> KernelResult<u32> {
        let id = self.peek_id()?;
        self.commit(id, record);
        Ok(id)
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.records.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        self.records.remove(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.records.iter_mut().map(|(id, r)| (*id, r))
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut arena = Arena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        arena.remove(b);
        let c = arena.insert("c").unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn peek_without_commit_does_not_consume_an_id() {
        let mut arena: Arena<&str> = Arena::new();
        assert_eq!(arena.peek_id().unwrap(), 1);
        assert_eq!(arena.peek_id().unwrap(), 1);
        assert_eq!(arena.insert("x").unwrap(), 1);
    }

    #[test]
    fn iteration_is_in_id_order() {
        let mut arena = Arena::new();
        for name in ["c", "a", "b"] {
            arena.insert(name).unwrap();
        }
        let ids: Vec<u32> = arena.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn lock_bounded_gives_up_when_contended() {
        let lock = Arc::new(Mutex::new(0u32));
        let _held = lock.lock();
        let start = Instant::now();
        assert!(lock_bounded(&lock, Duration::from_millis(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sweep_outcome_helpers() {
        assert!(SweepOutcome::Skipped.is_skipped());
        assert_eq!(SweepOutcome::Skipped.acted(), 0);
        let done = SweepOutcome::Completed { visited: 3, acted: 1 };
        assert!(!done.is_skipped());
        assert_eq!(done.acted(), 1);
    }
}
