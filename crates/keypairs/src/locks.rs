//! Per-organization generation locks
//!
//! At most one generation may be in flight per organization. A waiter
//! acquires the lock after the holder finishes and re-checks completeness
//! itself. Guards release on drop, so a cancelled request never leaves the
//! organization locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sealkeep_core::model::OrgId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct GenerationLocks {
    locks: Mutex<HashMap<OrgId, Arc<AsyncMutex<()>>>>,
}

impl GenerationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive generation rights on `org_id`
    pub async fn acquire(&self, org_id: OrgId) -> GenerationGuard<'_> {
        let lock = self.map().entry(org_id).or_default().clone();
        let guard = lock.lock_owned().await;
        GenerationGuard {
            locks: self,
            org_id,
            guard: Some(guard),
        }
    }

    /// Organizations with a holder or waiter
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.map().len()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<OrgId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget the lock once nobody holds or waits on it. Clones are only
    /// taken under the map lock, so a count of one is stable here.
    fn release(&self, org_id: OrgId) {
        let mut map = self.map();
        if map.get(&org_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&org_id);
        }
    }
}

pub struct GenerationGuard<'a> {
    locks: &'a GenerationLocks,
    org_id: OrgId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(self.org_id);
    }
}
