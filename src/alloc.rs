//! handle allocation and reuse

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::StoreState;

/// opaque external identifier for a stored object
///
/// handles start at 1 and are recycled after delete.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl From<u64> for Handle {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for Handle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// owns the handle counter and the pool of freed handles
///
/// not synchronized; the store only touches it under its lock.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    /// highest handle ever issued (0 = none yet)
    next: u64,
    /// freed handles, most recently freed last
    free: Vec<Handle>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// issue a handle, preferring the most recently freed one
    pub fn allocate(&mut self) -> Result<Handle> {
        if let Some(handle) = self.free.pop() {
            return Ok(handle);
        }
        self.next = self.next.checked_add(1).ok_or(Error::HandlesExhausted)?;
        Ok(Handle(self.next))
    }

    /// return a handle to the free pool
    pub fn release(&mut self, handle: Handle) {
        debug_assert!(handle.0 >= 1 && handle.0 <= self.next);
        debug_assert!(!self.free.contains(&handle));
        self.free.push(handle);
    }

    /// true if the handle has been issued and is not in the free pool
    pub fn is_issued(&self, handle: Handle) -> bool {
        handle.0 >= 1 && handle.0 <= self.next && !self.free.contains(&handle)
    }

    pub fn next_handle(&self) -> u64 {
        self.next
    }

    pub fn free_handles(&self) -> &[Handle] {
        &self.free
    }

    pub fn snapshot(&self) -> StoreState {
        StoreState {
            next_handle: self.next,
            free_handles: self.free.iter().map(Handle::get).collect(),
        }
    }

    /// rebuild from persisted state, rejecting states that could hand out
    /// the same handle twice
    pub fn restore(state: StoreState) -> std::result::Result<Self, String> {
        let mut seen = HashSet::with_capacity(state.free_handles.len());
        for &h in &state.free_handles {
            if h == 0 || h > state.next_handle {
                return Err(format!(
                    "free handle {} outside issued range 1..={}",
                    h, state.next_handle
                ));
            }
            if !seen.insert(h) {
                return Err(format!("free handle {} listed twice", h));
            }
        }

        Ok(Self {
            next: state.next_handle,
            free: state.free_handles.into_iter().map(Handle).collect(),
        })
    }

    /// bring the allocator in line with the handles that have links
    ///
    /// raises the counter to the highest live handle and pulls live handles
    /// out of the free pool. returns how many free entries were removed.
    pub fn reconcile(&mut self, live: &[Handle]) -> usize {
        if let Some(max) = live.iter().max() {
            self.next = self.next.max(max.0);
        }

        let live: HashSet<Handle> = live.iter().copied().collect();
        let before = self.free.len();
        self.free.retain(|h| !live.contains(h));
        before - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_monotonic() {
        let mut alloc = HandleAllocator::new();
        let handles: Vec<u64> = (0..5).map(|_| alloc.allocate().unwrap().get()).collect();
        assert_eq!(handles, vec![1, 2, 3, 4, 5]);
        assert_eq!(alloc.next_handle(), 5);
    }

    #[test]
    fn test_release_and_reuse_lifo() {
        let mut alloc = HandleAllocator::new();
        for _ in 0..5 {
            alloc.allocate().unwrap();
        }

        alloc.release(Handle(2));
        alloc.release(Handle(4));

        assert!(!alloc.is_issued(Handle(2)));
        assert!(alloc.is_issued(Handle(3)));

        assert_eq!(alloc.allocate().unwrap(), Handle(4));
        assert_eq!(alloc.allocate().unwrap(), Handle(2));
        assert_eq!(alloc.allocate().unwrap(), Handle(6));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut alloc = HandleAllocator::new();
        for _ in 0..10 {
            alloc.allocate().unwrap();
        }
        alloc.release(Handle(7));
        alloc.release(Handle(3));

        let restored = HandleAllocator::restore(alloc.snapshot()).unwrap();
        assert_eq!(restored.next_handle(), 10);
        assert_eq!(restored.free_handles(), &[Handle(7), Handle(3)]);
    }

    #[test]
    fn test_restore_rejects_out_of_range() {
        let state = StoreState {
            next_handle: 3,
            free_handles: vec![4],
        };
        assert!(HandleAllocator::restore(state).is_err());

        let state = StoreState {
            next_handle: 3,
            free_handles: vec![0],
        };
        assert!(HandleAllocator::restore(state).is_err());
    }

    #[test]
    fn test_restore_rejects_duplicates() {
        let state = StoreState {
            next_handle: 3,
            free_handles: vec![2, 2],
        };
        assert!(HandleAllocator::restore(state).is_err());
    }

    #[test]
    fn test_reconcile_raises_counter() {
        let mut alloc = HandleAllocator::new();
        assert_eq!(alloc.reconcile(&[Handle(1), Handle(4)]), 0);
        assert_eq!(alloc.next_handle(), 4);
        assert_eq!(alloc.allocate().unwrap(), Handle(5));
    }

    #[test]
    fn test_reconcile_drops_live_free_handles() {
        let mut alloc = HandleAllocator::restore(StoreState {
            next_handle: 5,
            free_handles: vec![2, 4, 3],
        })
        .unwrap();

        assert_eq!(alloc.reconcile(&[Handle(1), Handle(4), Handle(5)]), 1);
        assert_eq!(alloc.next_handle(), 5);
        assert_eq!(alloc.free_handles(), &[Handle(2), Handle(3)]);
        assert!(alloc.is_issued(Handle(4)));
    }

    #[test]
    fn test_reconcile_consistent_is_noop() {
        let mut alloc = HandleAllocator::restore(StoreState {
            next_handle: 3,
            free_handles: vec![2],
        })
        .unwrap();

        assert_eq!(alloc.reconcile(&[Handle(1), Handle(3)]), 0);
        assert_eq!(alloc.next_handle(), 3);
        assert_eq!(alloc.free_handles(), &[Handle(2)]);
    }

    #[test]
    fn test_exhausted() {
        let mut alloc = HandleAllocator::restore(StoreState {
            next_handle: u64::MAX,
            free_handles: vec![],
        })
        .unwrap();
        assert!(matches!(alloc.allocate(), Err(Error::HandlesExhausted)));
    }

    #[test]
    fn test_handle_parse_display() {
        let h: Handle = "42".parse().unwrap();
        assert_eq!(h, Handle::from_raw(42));
        assert_eq!(h.to_string(), "42");
        assert!("x".parse::<Handle>().is_err());
    }
}
