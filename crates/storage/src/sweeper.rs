//! Background reclamation of expired records.
//!
//! A pass deletes expired jobs (with their history and parameters), sorted
//! set entries, hashes, and abandoned lock records. Work is done in bounded
//! transactions so foreground writers are never blocked for long, and every
//! step re-checks expiry inside its transaction, so overlapping passes are
//! harmless. Passes still serialize on a distributed lock to avoid wasted
//! work when several processes run a sweeper.

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use jobvault_store::{Record, RecordStore, Table};

use crate::error::{StorageError, StorageResult};
use crate::lock::LockManager;
use crate::options::StorageOptions;
use crate::schema::Database;
use crate::workers::{WorkerHandle, spawn_periodic};

const SWEEPER_LOCK: &str = "locks:expiration-sweeper";

/// Records deleted by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub jobs: usize,
    pub set_entries: usize,
    pub hashes: usize,
    pub locks: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.jobs + self.set_entries + self.hashes + self.locks
    }
}

#[derive(Debug, Clone)]
pub struct ExpirationSweeper<S> {
    store: S,
    locks: LockManager<S>,
    interval: Duration,
    batch_size: usize,
    lock_timeout: Duration,
}

impl<S> ExpirationSweeper<S>
where
    S: RecordStore<State = Database> + Clone,
{
    pub fn new(store: S, options: &StorageOptions) -> Self {
        let locks = LockManager::new(store.clone(), options.lock_poll_interval, options.lock_lifetime);
        Self {
            store,
            locks,
            interval: options.sweep_interval,
            batch_size: options.sweep_batch_size.max(1),
            lock_timeout: options.sweep_lock_timeout,
        }
    }

    /// Run one pass. Returns `None` when another sweeper holds the lock.
    #[instrument(skip(self), err)]
    pub fn run_once(&self) -> StorageResult<Option<SweepReport>> {
        let guard = match self.locks.acquire(SWEEPER_LOCK, self.lock_timeout) {
            Ok(guard) => guard,
            Err(err) if err.is_timeout() => {
                debug!("expiration sweep already running elsewhere; skipping");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let report = SweepReport {
            jobs: self.drain("jobs", |db, limit| {
                let keys = expired_keys(&db.jobs, limit, |j| is_expired(j.expire_at, now));
                keys.iter().filter(|id| db.delete_job(id)).count()
            })?,
            set_entries: self.drain("sets", |db, limit| {
                let keys = expired_keys(&db.sets, limit, |e| is_expired(e.expire_at, now));
                remove_all(&mut db.sets, keys)
            })?,
            hashes: self.drain("hashes", |db, limit| {
                let keys = expired_keys(&db.hashes, limit, |h| is_expired(h.expire_at, now));
                remove_all(&mut db.hashes, keys)
            })?,
            locks: self.drain("locks", |db, limit| {
                let keys = expired_keys(&db.locks, limit, |l| l.expires_at <= now);
                remove_all(&mut db.locks, keys)
            })?,
        };

        guard.release()?;

        if report.total() > 0 {
            info!(
                jobs = report.jobs,
                set_entries = report.set_entries,
                hashes = report.hashes,
                locks = report.locks,
                "expired records removed"
            );
        }
        Ok(Some(report))
    }

    /// Apply `step` in successive transactions until it removes fewer than a
    /// full batch.
    fn drain(
        &self,
        table: &'static str,
        mut step: impl FnMut(&mut Database, usize) -> usize,
    ) -> StorageResult<usize> {
        let mut total = 0;
        loop {
            let removed = self
                .store
                .write(|db| Ok::<_, StorageError>(step(db, self.batch_size)))
                .map_err(|e| e.context("sweep", table))?;
            total += removed;
            if removed < self.batch_size {
                return Ok(total);
            }
        }
    }
}

impl<S> ExpirationSweeper<S>
where
    S: RecordStore<State = Database> + Clone + 'static,
{
    /// Run passes every `sweep_interval` on a background thread.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let interval = self.interval;
        spawn_periodic("jobvault-expiration-sweeper", interval, move || {
            self.run_once().map(|_| ())
        })
    }
}

fn is_expired(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expire_at.is_some_and(|at| at <= now)
}

fn expired_keys<R: Record>(table: &Table<R>, limit: usize, expired: impl Fn(&R) -> bool) -> Vec<R::Key> {
    table.query(expired).take(limit).map(Record::key).collect()
}

fn remove_all<R: Record>(table: &mut Table<R>, keys: Vec<R::Key>) -> usize {
    keys.iter().filter(|key| table.remove(key).is_some()).count()
}
