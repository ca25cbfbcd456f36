//! Cooperative cancellation for blocking waits.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::time;

/// Cancellation signal shared between a blocking caller and whoever may want
/// to stop it early. Clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, returning early when cancelled.
    ///
    /// Returns `true` if the token is cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = time::deadline(timeout);

        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let Some(left) = time::remaining(deadline) else {
                break;
            };
            cancelled = cvar
                .wait_timeout(cancelled, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        *cancelled
    }
}
