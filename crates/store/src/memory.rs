use std::sync::{PoisonError, RwLock};

use crate::error::StoreError;
use crate::r#trait::RecordStore;

/// In-memory transactional store.
///
/// Every write runs against a working copy of the state which replaces the
/// committed state only when the transaction closure succeeds, so a failed or
/// panicking transaction leaves nothing behind. The write lock is held for the
/// whole transaction, which serializes writers.
///
/// Intended for tests/dev and embedded use. Not optimized for large states:
/// each write clones the state.
#[derive(Debug, Default)]
pub struct InMemoryStore<S> {
    state: RwLock<S>,
}

impl<S> InMemoryStore<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

impl<S: Clone> InMemoryStore<S> {
    /// Run `f` against a working copy; `commit` gets the finished copy and may
    /// still veto it (used by durable backends to persist before swapping).
    pub(crate) fn write_with<R, E>(
        &self,
        f: impl FnOnce(&mut S) -> Result<R, E>,
        commit: impl FnOnce(&S) -> Result<(), StoreError>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        // The committed state is only ever replaced wholesale, so a poisoned
        // lock still guards a consistent value.
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut working = guard.clone();
        let out = f(&mut working)?;
        commit(&working)?;
        *guard = working;
        Ok(out)
    }
}

impl<S> RecordStore for InMemoryStore<S>
where
    S: Clone + Send + Sync,
{
    type State = S;

    fn read<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, StoreError> {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&guard))
    }

    fn write<R, E>(&self, f: impl FnOnce(&mut S) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        self.write_with(f, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Default)]
    struct Counters {
        a: u64,
        b: u64,
    }

    #[test]
    fn committed_writes_are_visible() {
        let store = InMemoryStore::new(Counters::default());
        store
            .write(|s| {
                s.a += 1;
                s.b += 1;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let (a, b) = store.read(|s| (s.a, s.b)).unwrap();
        assert_eq!((a, b), (1, 1));
    }

    #[test]
    fn failed_transaction_leaves_no_partial_write() {
        let store = InMemoryStore::new(Counters::default());
        let result = store.write(|s| {
            s.a += 1;
            Err::<(), _>(StoreError::Io("second half failed".into()))
        });

        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(store.read(|s| s.a).unwrap(), 0);
    }

    #[test]
    fn panicking_transaction_does_not_poison_the_store() {
        let store = Arc::new(InMemoryStore::new(Counters::default()));
        let s2 = store.clone();
        let joined = thread::spawn(move || {
            let _ = s2.write(|s| -> Result<(), StoreError> {
                s.a = 99;
                panic!("boom");
            });
        })
        .join();
        assert!(joined.is_err());

        assert_eq!(store.read(|s| s.a).unwrap(), 0);
        store
            .write(|s| {
                s.a += 1;
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(store.read(|s| s.a).unwrap(), 1);
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let store = Arc::new(InMemoryStore::new(Counters::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .write(|s| {
                                let seen = s.a;
                                s.a = seen + 1;
                                Ok::<_, StoreError>(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.read(|s| s.a).unwrap(), 800);
    }
}
