//! store statistics

use std::fmt;

use crate::content::HEADER_LEN;
use crate::error::{IoResultExt, Result};
use crate::store::ObjectStore;

/// store statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub live_handles: usize,
    pub free_handles: usize,
    pub next_handle: u64,
    pub content_records: usize,
    /// payload bytes actually on disk (headers excluded)
    pub stored_bytes: u64,
    /// payload bytes as seen by callers, counting every handle
    pub logical_bytes: u64,
}

impl StoreStats {
    /// logical / stored; 1.0 for an empty store
    pub fn dedup_ratio(&self) -> f64 {
        if self.stored_bytes == 0 {
            return 1.0;
        }
        self.logical_bytes as f64 / self.stored_bytes as f64
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "live handles:    {}", self.live_handles)?;
        writeln!(f, "free handles:    {}", self.free_handles)?;
        writeln!(f, "next handle:     {}", self.next_handle)?;
        writeln!(f, "content records: {}", self.content_records)?;
        writeln!(f, "stored bytes:    {}", self.stored_bytes)?;
        writeln!(f, "logical bytes:   {}", self.logical_bytes)?;
        write!(f, "dedup ratio:     {:.2}", self.dedup_ratio())
    }
}

/// collect store statistics under the store lock
pub fn stats(store: &ObjectStore) -> Result<StoreStats> {
    store.with_lock(|inner, content| {
        let mut s = StoreStats {
            live_handles: inner.links.list()?.0.len(),
            free_handles: inner.allocator.free_handles().len(),
            next_handle: inner.allocator.next_handle(),
            ..StoreStats::default()
        };

        let (hashes, _) = content.list()?;
        for hash in &hashes {
            let path = content.path(hash);
            let len = std::fs::metadata(&path)
                .with_path(&path)?
                .len()
                .saturating_sub(HEADER_LEN);
            let count = content.refcount(hash)?.max(0) as u64;

            s.content_records += 1;
            s.stored_bytes += len;
            s.logical_bytes += len * count;
        }

        Ok(s)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Handle;
    use crate::config::{Config, PersistMode};
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let config = Config {
            fsync: false,
            persist: PersistMode::Close,
        };
        let store = ObjectStore::open_with_config(&dir.path().join("store"), config).unwrap();
        (dir, store)
    }

    #[test]
    fn test_stats_empty() {
        let (_dir, store) = test_store();
        let s = stats(&store).unwrap();
        assert_eq!(s, StoreStats::default());
        assert_eq!(s.dedup_ratio(), 1.0);
    }

    #[test]
    fn test_stats_counts_dedup() {
        let (_dir, store) = test_store();
        for _ in 0..4 {
            store.put(b"0123456789").unwrap();
        }
        store.put(b"abc").unwrap();
        store.delete(Handle::from_raw(2)).unwrap();

        let s = stats(&store).unwrap();
        assert_eq!(s.live_handles, 4);
        assert_eq!(s.free_handles, 1);
        assert_eq!(s.next_handle, 5);
        assert_eq!(s.content_records, 2);
        assert_eq!(s.stored_bytes, 13);
        assert_eq!(s.logical_bytes, 33);
        assert!(s.dedup_ratio() > 2.5);
    }

    #[test]
    fn test_stats_display() {
        let (_dir, store) = test_store();
        store.put(b"x").unwrap();
        let text = stats(&store).unwrap().to_string();
        assert!(text.contains("live handles:    1"));
        assert!(text.contains("dedup ratio:     1.00"));
    }
}
