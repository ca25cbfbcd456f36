use std::sync::Arc;

use crate::error::StoreError;

/// Transactional record store.
///
/// A store owns a single typed state (usually a struct of [`Table`]s) and
/// exposes it through two entry points:
///
/// - `read`: run a closure against a consistent snapshot of the state
/// - `write`: run a closure as **one atomic transaction**
///
/// ## Write semantics
///
/// - Writers are serialized: no two write closures run concurrently.
/// - If the closure returns `Err`, none of its mutations become visible.
/// - If the closure returns `Ok`, all of its mutations become visible
///   together (and, for durable backends, are persisted before `write`
///   returns).
///
/// Closures must not block or call back into the store; they describe a
/// transaction, not a session.
///
/// [`Table`]: crate::Table
pub trait RecordStore: Send + Sync {
    /// The typed state held by this store.
    type State;

    /// Read from a consistent snapshot.
    fn read<R>(&self, f: impl FnOnce(&Self::State) -> R) -> Result<R, StoreError>;

    /// Run an atomic read-modify-write transaction.
    fn write<R, E>(&self, f: impl FnOnce(&mut Self::State) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>;
}

impl<S> RecordStore for Arc<S>
where
    S: RecordStore,
{
    type State = S::State;

    fn read<R>(&self, f: impl FnOnce(&Self::State) -> R) -> Result<R, StoreError> {
        (**self).read(f)
    }

    fn write<R, E>(&self, f: impl FnOnce(&mut Self::State) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        (**self).write(f)
    }
}
