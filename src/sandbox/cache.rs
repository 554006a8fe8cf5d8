//! Compiled-bytecode cache keyed by script digest.
//!
//! Each digest maps to a `OnceCell`. Callers racing on a cold digest share
//! the same cell, so the compile closure runs at most once per digest; a
//! failed compile leaves the cell empty for the next caller to retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;
use sha2::{Digest as _, Sha256};
use tracing::debug;

use crate::packager::Digest;

/// Engine bytecode for one packaged script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEntry {
    /// Digest of the script this bytecode was produced from.
    pub digest: Digest,
    pub bytecode: Vec<u8>,
    /// SHA-256 of `bytecode`, checked before every load.
    pub checksum: [u8; 32],
}

impl CompiledEntry {
    pub fn new(digest: Digest, bytecode: Vec<u8>) -> Self {
        let checksum = Sha256::digest(&bytecode).into();
        Self {
            digest,
            bytecode,
            checksum,
        }
    }

    /// True when the entry belongs to `digest` and its bytecode is intact.
    pub fn is_valid_for(&self, digest: &Digest) -> bool {
        let checksum: [u8; 32] = Sha256::digest(&self.bytecode).into();
        self.digest == *digest && self.checksum == checksum
    }
}

type Cell = Arc<OnceCell<Arc<CompiledEntry>>>;

#[derive(Debug, Default)]
pub struct ScriptCache {
    cells: Mutex<HashMap<Digest, Cell>>,
    compiles: AtomicUsize,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<Digest, Cell>> {
        // The map is never left half-updated, so a poisoned lock is still usable
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn get(&self, digest: &Digest) -> Option<Arc<CompiledEntry>> {
        self.cells().get(digest).and_then(|cell| cell.get().cloned())
    }

    #[cfg(test)]
    /// Stores `entry` under `digest`, replacing any previous entry.
    pub fn put(&self, digest: Digest, entry: CompiledEntry) {
        let cell = OnceCell::with_value(Arc::new(entry));
        self.cells().insert(digest, Arc::new(cell));
    }

    /// Returns the cached entry for `digest`, running `compile` if there is none.
    pub fn get_or_compile<E>(
        &self,
        digest: &Digest,
        compile: impl FnOnce() -> Result<CompiledEntry, E>,
    ) -> Result<Arc<CompiledEntry>, E> {
        let cell = Arc::clone(self.cells().entry(*digest).or_default());

        // The map lock is released here; only callers of this digest wait
        let entry = cell.get_or_try_init(|| {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            debug!(digest = %digest.short(), "Compiling script");
            compile().map(Arc::new)
        })?;
        Ok(Arc::clone(entry))
    }

    /// Drops the entry for `digest`. Returns whether one was present.
    pub fn invalidate(&self, digest: &Digest) -> bool {
        self.cells()
            .remove(digest)
            .is_some_and(|cell| cell.get().is_some())
    }

    #[cfg(test)]
    /// Number of compiled entries.
    pub fn len(&self) -> usize {
        self.cells().values().filter(|cell| cell.get().is_some()).count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    /// Number of times a compile closure has been started.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn digest(n: u8) -> Digest {
        Digest::of(&[n])
    }

    fn entry(n: u8) -> CompiledEntry {
        CompiledEntry::new(digest(n), vec![n; 8])
    }

    #[test]
    fn test_get_on_empty_cache() {
        let cache = ScriptCache::new();
        assert!(cache.get(&digest(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_last_write_wins() {
        let cache = ScriptCache::new();
        cache.put(digest(1), entry(1));
        cache.put(digest(1), CompiledEntry::new(digest(1), vec![9; 4]));
        assert_eq!(cache.get(&digest(1)).unwrap().bytecode, vec![9; 4]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_compile_compiles_once() {
        let cache = ScriptCache::new();
        let first = cache
            .get_or_compile(&digest(1), || Ok::<_, ()>(entry(1)))
            .unwrap();
        let second = cache
            .get_or_compile(&digest(1), || -> Result<CompiledEntry, ()> { panic!("recompiled") })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn test_failed_compile_is_retried() {
        let cache = ScriptCache::new();
        let err = cache.get_or_compile(&digest(1), || Err("boom"));
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.get(&digest(1)).is_none());

        let ok = cache.get_or_compile(&digest(1), || Ok::<_, &str>(entry(1)));
        assert!(ok.is_ok());
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn test_concurrent_cold_start_compiles_once() {
        let cache = ScriptCache::new();
        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    cache
                        .get_or_compile(&digest(7), || {
                            thread::sleep(Duration::from_millis(50));
                            Ok::<_, ()>(entry(7))
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(cache.compile_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_digests_coexist() {
        let cache = ScriptCache::new();
        cache.put(digest(1), entry(1));
        cache.put(digest(2), entry(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.invalidate(&digest(1)));
        assert!(!cache.invalidate(&digest(1)));
        assert!(cache.get(&digest(2)).is_some());
    }

    #[test]
    fn test_entry_validation() {
        let mut e = entry(1);
        assert!(e.is_valid_for(&digest(1)));
        assert!(!e.is_valid_for(&digest(2)));
        e.bytecode[0] ^= 0xff;
        assert!(!e.is_valid_for(&digest(1)));
    }
}
