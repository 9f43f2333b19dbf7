//! Per-project deployment serialization

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per project. Deployments of the same project queue up,
/// different projects proceed in parallel. A project's entry lives only
/// while someone holds or waits for it.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one project until dropped
pub struct ProjectGuard<'a> {
    locks: &'a ProjectLocks,
    project_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProjectGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.project_id);
    }
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `project_id`
    pub async fn acquire(&self, project_id: Uuid) -> ProjectGuard<'_> {
        let lock = self.map().entry(project_id).or_default().clone();
        let guard = lock.lock_owned().await;
        ProjectGuard {
            locks: self,
            project_id,
            guard: Some(guard),
        }
    }

    /// Number of projects currently holding or awaiting a lock
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, project_id: Uuid) {
        let mut locks = self.map();
        // Only the map's own reference left: nobody holds or waits
        if locks.get(&project_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&project_id);
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
