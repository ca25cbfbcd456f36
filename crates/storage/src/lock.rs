//! Distributed locks on top of the record store.
//!
//! A lock is a record keyed by resource name. Taking it is a conditional
//! insert inside one transaction; waiting is sleep-then-retry until the
//! caller's deadline. A holder that dies without releasing leaves a record
//! whose `expires_at` eventually passes, at which point the next caller
//! reclaims it.

use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use jobvault_core::{LockToken, require_non_empty};
use jobvault_store::{RecordStore, StoreError};

use crate::error::LockError;
use crate::schema::{Database, LockRecord};
use crate::time;

/// Hands out [`LockGuard`]s for named resources.
#[derive(Debug, Clone)]
pub struct LockManager<S> {
    store: S,
    poll_interval: Duration,
    lifetime: Duration,
}

impl<S> LockManager<S>
where
    S: RecordStore<State = Database> + Clone,
{
    pub fn new(store: S, poll_interval: Duration, lifetime: Duration) -> Self {
        Self {
            store,
            poll_interval,
            lifetime,
        }
    }

    /// Block until `resource` is ours or `timeout` elapses.
    ///
    /// A zero timeout still makes one attempt.
    #[instrument(skip(self), err)]
    pub fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard<S>, LockError> {
        require_non_empty("resource", resource)?;

        let deadline = time::deadline(timeout);
        let token = LockToken::new();

        loop {
            if self.try_acquire(resource, &token)? {
                debug!(resource, "lock acquired");
                return Ok(LockGuard {
                    store: self.store.clone(),
                    resource: resource.to_string(),
                    token,
                    lifetime: self.lifetime,
                    released: false,
                });
            }

            let Some(left) = time::remaining(deadline) else {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    timeout,
                });
            };
            thread::sleep(self.poll_interval.min(left));
        }
    }

    fn try_acquire(&self, resource: &str, token: &LockToken) -> Result<bool, LockError> {
        let now = Utc::now();
        let key = resource.to_string();

        self.store
            .write(|db| {
                if let Some(held) = db.locks.find(&key) {
                    if held.expires_at > now {
                        return Ok(false);
                    }
                    warn!(resource, abandoned_at = %held.expires_at, "reclaiming abandoned lock");
                }

                db.locks.insert(LockRecord {
                    resource: key.clone(),
                    token: token.clone(),
                    acquired_at: now,
                    expires_at: time::add(now, self.lifetime),
                });
                Ok::<_, StoreError>(true)
            })
            .map_err(|source| LockError::Acquisition {
                resource: resource.to_string(),
                source,
            })
    }
}

/// A held lock. Released explicitly with [`LockGuard::release`] or
/// implicitly when dropped.
#[derive(Debug)]
pub struct LockGuard<S>
where
    S: RecordStore<State = Database>,
{
    store: S,
    resource: String,
    token: LockToken,
    lifetime: Duration,
    released: bool,
}

impl<S> LockGuard<S>
where
    S: RecordStore<State = Database>,
{
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock, reporting store failures.
    ///
    /// If the lock was already reclaimed by someone else (we outlived the
    /// lifetime) their record is left alone.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.delete_if_held()
    }

    /// Push `expires_at` forward by the lock lifetime. Returns `false` if the
    /// lock is no longer ours.
    pub fn refresh(&self) -> Result<bool, LockError> {
        let now = Utc::now();

        self.store
            .write(|db| match db.locks.find_mut(&self.resource) {
                Some(held) if held.token == self.token => {
                    held.expires_at = time::add(now, self.lifetime);
                    Ok::<_, StoreError>(true)
                }
                _ => Ok(false),
            })
            .map_err(|source| LockError::Release {
                resource: self.resource.clone(),
                source,
            })
    }

    fn delete_if_held(&self) -> Result<(), LockError> {
        let removed = self
            .store
            .write(|db| {
                let ours = db
                    .locks
                    .find(&self.resource)
                    .is_some_and(|held| held.token == self.token);
                if ours {
                    db.locks.remove(&self.resource);
                }
                Ok::<_, StoreError>(ours)
            })
            .map_err(|source| LockError::Release {
                resource: self.resource.clone(),
                source,
            })?;

        if removed {
            debug!(resource = %self.resource, "lock released");
        } else {
            warn!(resource = %self.resource, "lock was reclaimed before release");
        }
        Ok(())
    }
}

impl<S> Drop for LockGuard<S>
where
    S: RecordStore<State = Database>,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.delete_if_held() {
            warn!(resource = %self.resource, error = %err, "failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use jobvault_store::InMemoryStore;

    type Store = Arc<InMemoryStore<Database>>;

    fn manager(lifetime: Duration) -> LockManager<Store> {
        LockManager::new(
            Arc::new(InMemoryStore::new(Database::default())),
            Duration::from_millis(5),
            lifetime,
        )
    }

    fn holder(store: &Store, resource: &str) -> Option<LockToken> {
        store
            .read(|db| db.locks.find(&resource.to_string()).map(|l| l.token.clone()))
            .unwrap()
    }

    #[test]
    fn acquire_and_release() {
        let locks = manager(Duration::from_secs(60));

        let guard = locks.acquire("resource", Duration::ZERO).unwrap();
        assert_eq!(guard.resource(), "resource");
        assert!(holder(&locks.store, "resource").is_some());

        guard.release().unwrap();
        assert!(holder(&locks.store, "resource").is_none());
    }

    #[test]
    fn drop_releases() {
        let locks = manager(Duration::from_secs(60));
        {
            let _guard = locks.acquire("resource", Duration::ZERO).unwrap();
        }
        assert!(locks.acquire("resource", Duration::ZERO).is_ok());
    }

    #[test]
    fn held_lock_times_out() {
        let locks = manager(Duration::from_secs(60));
        let _held = locks.acquire("resource", Duration::ZERO).unwrap();

        let err = locks
            .acquire("resource", Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn different_resources_do_not_contend() {
        let locks = manager(Duration::from_secs(60));
        let _a = locks.acquire("a", Duration::ZERO).unwrap();
        assert!(locks.acquire("b", Duration::ZERO).is_ok());
    }

    #[test]
    fn empty_resource_is_rejected() {
        let locks = manager(Duration::from_secs(60));
        let err = locks.acquire("", Duration::ZERO).unwrap_err();
        assert!(matches!(err, LockError::Validation(_)));
    }

    #[test]
    fn abandoned_lock_is_reclaimed() {
        let locks = manager(Duration::from_millis(10));
        std::mem::forget(locks.acquire("resource", Duration::ZERO).unwrap());

        let guard = locks.acquire("resource", Duration::from_secs(2)).unwrap();
        guard.release().unwrap();
    }

    #[test]
    fn stale_holder_does_not_release_new_holder() {
        let locks = manager(Duration::from_millis(10));
        let stale = locks.acquire("resource", Duration::ZERO).unwrap();
        thread::sleep(Duration::from_millis(30));

        let fresh = locks.acquire("resource", Duration::ZERO).unwrap();
        assert!(!stale.refresh().unwrap());
        stale.release().unwrap();

        assert_eq!(holder(&locks.store, "resource"), Some(fresh.token.clone()));
        assert!(fresh.refresh().unwrap());
    }

    #[test]
    fn only_one_holder_at_a_time() {
        let locks = manager(Duration::from_secs(60));
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let guard = locks.acquire("shared", Duration::from_secs(10)).unwrap();
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        thread::sleep(Duration::from_millis(1));
                        inside.store(false, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                        guard.release().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 20);
    }
}
