//! Named job queues with claim-based delivery.
//!
//! A dequeued entry is not removed: it is marked `fetched_at = now` and stays
//! invisible to other consumers for `fetch_timeout`. The worker then either
//! acknowledges it (delete) or requeues it (clear the mark). A worker that
//! dies does neither and the entry becomes visible again once the fetch
//! timeout passes.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace};

use jobvault_core::{JobId, QueueEntryId, ValidationError, require_non_empty};
use jobvault_store::RecordStore;

use crate::cancel::CancellationToken;
use crate::error::{StorageError, StorageResult};
use crate::options::{PollBackoff, StorageOptions};
use crate::schema::Database;
use crate::time;

/// Visible entries considered per scan before backing off.
const CLAIM_CANDIDATES: usize = 16;

#[derive(Debug, Clone)]
pub struct QueueService<S> {
    store: S,
    fetch_timeout: Duration,
    wait_timeout: Duration,
    backoff: PollBackoff,
}

impl<S> QueueService<S>
where
    S: RecordStore<State = Database> + Clone,
{
    pub fn new(store: S, options: &StorageOptions) -> Self {
        Self {
            store,
            fetch_timeout: options.fetch_timeout,
            wait_timeout: options.dequeue_wait_timeout,
            backoff: options.queue_poll_backoff.clone(),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub fn enqueue(&self, queue: &str, job_id: &JobId) -> StorageResult<QueueEntryId> {
        require_non_empty("queue", queue)?;

        let now = Utc::now();
        let id = self
            .store
            .write(|db| Ok::<_, StorageError>(db.push_queue_entry(queue, job_id, now)))
            .map_err(|e| e.context("enqueue", queue))?;

        debug!(queue, entry_id = %id, "job enqueued");
        Ok(id)
    }

    /// Wait for the next job from `queues` with the configured timeouts.
    pub fn dequeue(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> StorageResult<Option<FetchedJob<S>>> {
        self.dequeue_with(queues, self.fetch_timeout, self.wait_timeout, cancel)
    }

    /// Wait for the next job from `queues`.
    ///
    /// Queues are scanned in the order given and each queue in FIFO order.
    /// Returns `None` once `wait_timeout` passes or `cancel` fires without a
    /// visible entry showing up.
    pub fn dequeue_with(
        &self,
        queues: &[&str],
        fetch_timeout: Duration,
        wait_timeout: Duration,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<FetchedJob<S>>> {
        if queues.is_empty() {
            return Err(ValidationError::empty("queues").into());
        }
        for queue in queues {
            require_non_empty("queue", queue)?;
        }

        let deadline = time::deadline(wait_timeout);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(fetched) = self.try_claim(queues, fetch_timeout)? {
                return Ok(Some(fetched));
            }

            attempt = attempt.saturating_add(1);
            let Some(left) = time::remaining(deadline) else {
                trace!(?queues, "dequeue wait timed out");
                return Ok(None);
            };
            if cancel.wait(self.backoff.delay_for_attempt(attempt).min(left)) {
                return Ok(None);
            }
        }
    }

    fn try_claim(&self, queues: &[&str], fetch_timeout: Duration) -> StorageResult<Option<FetchedJob<S>>> {
        let now = Utc::now();
        let stale_before = time::sub(now, fetch_timeout);

        let candidates: Vec<(String, u64)> = self
            .store
            .read(|db| {
                queues
                    .iter()
                    .flat_map(|queue| db.queue_entries(queue))
                    .filter(|entry| entry.is_visible(stale_before))
                    .take(CLAIM_CANDIDATES)
                    .map(|entry| (entry.queue.clone(), entry.seq))
                    .collect()
            })
            .map_err(|e| StorageError::from(e).context("dequeue", queues.join(",")))?;

        for key in candidates {
            // Re-check inside the transaction: another consumer may have
            // claimed it since the scan.
            let claimed = self
                .store
                .write(|db| match db.queue.find_mut(&key) {
                    Some(entry) if entry.is_visible(stale_before) => {
                        entry.fetched_at = Some(now);
                        Ok::<_, StorageError>(Some(entry.clone()))
                    }
                    _ => Ok(None),
                })
                .map_err(|e| e.context("dequeue", key.0.as_str()))?;

            match claimed {
                Some(entry) => {
                    debug!(queue = %entry.queue, job_id = %entry.job_id, "job fetched");
                    return Ok(Some(FetchedJob {
                        store: self.store.clone(),
                        id: entry.id,
                        key,
                        job_id: entry.job_id,
                        fetched_at: now,
                    }));
                }
                None => trace!(queue = %key.0, "lost claim race"),
            }
        }

        Ok(None)
    }

    /// Entries waiting to be fetched.
    pub fn enqueued_count(&self, queue: &str) -> StorageResult<usize> {
        self.store
            .read(|db| db.queue_entries(queue).filter(|e| e.fetched_at.is_none()).count())
            .map_err(|e| StorageError::from(e).context("enqueued_count", queue))
    }

    /// Entries currently claimed (including claims past their fetch timeout
    /// that nobody has re-taken yet).
    pub fn fetched_count(&self, queue: &str) -> StorageResult<usize> {
        self.store
            .read(|db| db.queue_entries(queue).filter(|e| e.fetched_at.is_some()).count())
            .map_err(|e| StorageError::from(e).context("fetched_count", queue))
    }

    /// Job ids of the first `limit` unfetched entries, oldest first.
    pub fn enqueued_job_ids(&self, queue: &str, limit: usize) -> StorageResult<Vec<JobId>> {
        self.store
            .read(|db| {
                db.queue_entries(queue)
                    .filter(|e| e.fetched_at.is_none())
                    .take(limit)
                    .map(|e| e.job_id.clone())
                    .collect()
            })
            .map_err(|e| StorageError::from(e).context("enqueued_job_ids", queue))
    }

    /// Names of every queue that has at least one entry.
    pub fn queue_names(&self) -> StorageResult<Vec<String>> {
        self.store
            .read(|db| {
                db.queue
                    .iter()
                    .map(|e| e.queue.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .map_err(|e| StorageError::from(e).context("queue_names", ""))
    }
}

/// A claimed queue entry.
///
/// Dropping it without acknowledging leaves the claim in place until the
/// fetch timeout passes.
#[derive(Debug)]
pub struct FetchedJob<S> {
    store: S,
    id: QueueEntryId,
    key: (String, u64),
    job_id: JobId,
    fetched_at: DateTime<Utc>,
}

impl<S> FetchedJob<S>
where
    S: RecordStore<State = Database>,
{
    pub fn id(&self) -> &QueueEntryId {
        &self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.key.0
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Delete the entry. Returns `false` if our claim was lost (re-taken
    /// after the fetch timeout), in which case nothing changes.
    pub fn acknowledge(self) -> StorageResult<bool> {
        let done = self
            .store
            .write(|db| {
                let ours = self.still_claimed(db);
                if ours {
                    db.queue.remove(&self.key);
                }
                Ok::<_, StorageError>(ours)
            })
            .map_err(|e| e.context("acknowledge", self.job_id.as_str()))?;

        self.log_outcome("acknowledged", done);
        Ok(done)
    }

    /// Make the entry visible again. Returns `false` if our claim was lost.
    pub fn requeue(self) -> StorageResult<bool> {
        let done = self
            .store
            .write(|db| {
                let ours = self.still_claimed(db);
                if let Some(entry) = db.queue.find_mut(&self.key).filter(|_| ours) {
                    entry.fetched_at = None;
                }
                Ok::<_, StorageError>(ours)
            })
            .map_err(|e| e.context("requeue", self.job_id.as_str()))?;

        self.log_outcome("requeued", done);
        Ok(done)
    }

    fn still_claimed(&self, db: &Database) -> bool {
        db.queue
            .find(&self.key)
            .is_some_and(|e| e.id == self.id && e.fetched_at == Some(self.fetched_at))
    }

    fn log_outcome(&self, action: &str, done: bool) {
        if done {
            debug!(queue = %self.key.0, job_id = %self.job_id, action, "queue entry released");
        } else {
            debug!(queue = %self.key.0, job_id = %self.job_id, action, "claim already lost");
        }
    }
}
