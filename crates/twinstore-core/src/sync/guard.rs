//! In-flight sync key set with RAII release.
//!
//! A key is held for the whole replication attempt (retries included) and is
//! released when the [`SyncGuard`] drops, including on early return, panic
//! unwinding, or cancellation of the owning future.

use dashmap::DashSet;
use std::sync::Arc;
use twinstore_types::SyncKey;

/// Concurrent set of sync keys currently being replicated.
///
/// Backed by a sharded `DashSet`, so check-and-insert is atomic per key and
/// unrelated keys never contend on one lock.
#[derive(Debug, Clone, Default)]
pub struct SyncGuardSet {
    inner: Arc<DashSet<SyncKey>>,
}

impl SyncGuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `None` when another attempt already holds it.
    pub fn try_acquire(&self, key: &SyncKey) -> Option<SyncGuard> {
        if self.inner.insert(key.clone()) {
            Some(SyncGuard { set: Arc::clone(&self.inner), key: key.clone() })
        } else {
            None
        }
    }

    pub fn contains(&self, key: &SyncKey) -> bool {
        self.inner.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Holds one key in the guard set; removes it on drop.
#[derive(Debug)]
pub struct SyncGuard {
    set: Arc<DashSet<SyncKey>>,
    key: SyncKey,
}

impl SyncGuard {
    pub fn key(&self) -> &SyncKey {
        &self.key
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}
