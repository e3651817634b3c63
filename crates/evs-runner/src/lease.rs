use std::sync::Arc;

use evs_core::Lease;
use evs_storage::SubmissionStore;
use tracing::warn;

/// Holds a task/window lease for one controller operation. The lease is
/// released on drop; if that fails it simply runs out at `expires_at`.
pub struct LeaseGuard {
    store: Arc<dyn SubmissionStore>,
    lease: Lease,
}

impl LeaseGuard {
    pub fn new(store: Arc<dyn SubmissionStore>, lease: Lease) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lease(&self.lease) {
            warn!(
                task = %self.lease.key,
                expires_at = %self.lease.expires_at,
                error = %e,
                "lease release failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evs_core::TaskWindow;
    use evs_storage::InMemoryStore;

    #[test]
    fn drop_releases_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let key = TaskWindow::new("ET-0001", "2025-Q4");
        let lease = store.try_acquire_lease(&key, "w1", 60).unwrap().unwrap();
        let guard = LeaseGuard::new(store.clone(), lease);
        assert_eq!(guard.lease().owner, "w1");
        assert!(store.try_acquire_lease(&key, "w2", 60).unwrap().is_none());
        drop(guard);
        assert!(store.try_acquire_lease(&key, "w2", 60).unwrap().is_some());
    }
}
