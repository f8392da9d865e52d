//! Process-wide persistence context: cache budgets and pool path allocation.
//!
//! The original design kept this as a global singleton; here it is an
//! explicit object handed to the storage constructor so tests can run
//! several independent instances side by side.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use embershard_core::{PsError, PsResult};
use parking_lot::Mutex;

/// A byte-granular cache budget shared by many pools.
///
/// `acquire` is optimistic: it adds first and backs out on overflow, so
/// concurrent pools never over-admit past the configured capacity.
#[derive(Debug, Default)]
pub struct CacheBudget {
    capacity: AtomicU64,
    acquired: AtomicU64,
}

impl CacheBudget {
    pub fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn acquire(&self, bytes: u64) -> bool {
        if self.acquired.fetch_add(bytes, Ordering::Relaxed) + bytes
            > self.capacity.load(Ordering::Relaxed)
        {
            self.acquired.fetch_sub(bytes, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn release(&self, bytes: u64) {
        self.acquired.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Persistence context for one server process.
///
/// Owns the persistent-pool root directory, hands out unique per-variable
/// pool paths, and carries the two DRAM cache budgets: the dynamic budget
/// pools draw from in prefetch chunks, and the reserved budget for
/// explicitly reserved items.
#[derive(Debug)]
pub struct PersistManager {
    root: Mutex<Option<PathBuf>>,
    prefix: String,
    next_pool_id: AtomicU64,
    pub dynamic_cache: CacheBudget,
    pub reserved_cache: CacheBudget,
}

impl Default for PersistManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistManager {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            root: Mutex::new(None),
            prefix: format!("{}-{}", now, std::process::id()),
            next_pool_id: AtomicU64::new(0),
            dynamic_cache: CacheBudget::default(),
            reserved_cache: CacheBudget::default(),
        }
    }

    /// Enable the persistent tier rooted at `path`. Fatal at startup if the
    /// directory cannot be created.
    pub fn initialize(&self, path: &Path) -> PsResult<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| PsError::Error(format!("cannot create pmem root {path:?}: {e}")))?;
        *self.root.lock() = Some(path.to_path_buf());
        Ok(())
    }

    pub fn use_pmem(&self) -> bool {
        self.root.lock().is_some()
    }

    /// Allocate a fresh, unique pool directory under the root.
    pub fn new_pmem_pool_path(&self) -> PsResult<PathBuf> {
        let root = self
            .root
            .lock()
            .clone()
            .ok_or_else(|| PsError::Error("persistent pool root not initialized".into()))?;
        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        Ok(root.join(format!("{}-{:06}", self.prefix, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_refuses_past_capacity() {
        let budget = CacheBudget::default();
        budget.set_capacity(100);
        assert!(budget.acquire(60));
        assert!(budget.acquire(40));
        assert!(!budget.acquire(1));
        budget.release(50);
        assert!(budget.acquire(50));
        assert_eq!(budget.acquired(), 100);
    }

    #[test]
    fn pool_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistManager::new();
        assert!(!manager.use_pmem());
        manager.initialize(dir.path()).unwrap();
        assert!(manager.use_pmem());

        let a = manager.new_pmem_pool_path().unwrap();
        let b = manager.new_pmem_pool_path().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
    }

    #[test]
    fn pool_path_requires_initialization() {
        let manager = PersistManager::new();
        assert!(manager.new_pmem_pool_path().is_err());
    }
}
